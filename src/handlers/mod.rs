// HTTP handlers, grouped by audience
//
// root   - tenant administration under /api/root
// tenant - routed data access under /api/tenant/:tenant_id
// public - liveness

pub mod public;
pub mod root;
pub mod tenant;
