pub mod impersonation;
pub mod org;
pub mod system;
pub mod user;

pub use impersonation::{
    ActiveSession, AuditAction, AuditEntry, ConsentGrant, SessionRecord,
};
pub use org::{
    CreateOrgRequest, OrgBranding, OrgCustomData, OrgRecord, OrgResponse, OrgTier,
    UpdateOrgRequest,
};
pub use system::{
    CreateSystemRequest, CreatedBy, InventoryRecord, SystemRecord, SystemResponse,
    UpdateSystemRequest,
};
pub use user::{
    CreateUserRequest, Subject, UpdateUserRequest, UserRecord, UserResponse,
};
