//! HTTP surface: the document endpoint for the crawler and the operator
//! dashboard, each on its own listener.

pub mod admission;
pub mod dashboard;
pub mod document;
pub mod error;
pub mod http;
pub mod session;

pub use admission::{AbortSignal, AdmissionPool, AdmissionStats, admission_middleware};
pub use dashboard::{DashboardState, PushTrigger, dashboard_router};
pub use document::{DocumentState, METADATA_HEADER, document_router};
pub use error::{ApiError, ApiResult};
pub use http::{HttpServer, bind};
pub use session::{Session, SessionManager};
