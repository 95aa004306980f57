pub mod auth;
pub mod filters;
pub mod impersonation;
pub mod me;
pub mod orgs;
pub mod systems;
pub mod users;
