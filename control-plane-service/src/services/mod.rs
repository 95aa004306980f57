pub mod cache;
pub mod database;
pub mod error;
pub mod identity;
pub mod idp;
pub mod impersonation;
pub mod roles;
pub mod token;

pub use cache::{CacheLayer, MockCache, RedisService};
pub use database::{Database, SystemFilters};
pub use error::ServiceError;
pub use identity::IdentityGateway;
pub use idp::{IdentityProvider, IdpClient, MockIdentityProvider};
pub use impersonation::{ImpersonationEngine, ImpersonationStatus};
pub use roles::RoleAccessService;
pub use token::{AccessTokenClaims, MintedToken, RefreshTokenClaims, TokenService};
