pub mod api;
pub mod attendance;
pub mod capture;
pub mod channel;
pub mod config;
pub mod credentials;
pub mod session;
pub mod transport;

pub use api::{ApiError, AttendanceApi, Confirmation, HttpApi};
pub use attendance::{Attendance, AttendanceError, AttemptOutcome};
pub use capture::{CaptureError, CaptureSource, CapturedImage, FileCapture};
pub use channel::{ChannelError, Detection, DetectionChannel, Readiness};
pub use config::Config;
pub use credentials::{
    CredentialError, CredentialStore, Credentials, FileCredentialStore, MemoryCredentialStore,
    UserProfile,
};
pub use session::{CaptureSession, Phase, Precondition, Rejection, SessionError, SessionState};
pub use transport::{ExtractorEnd, ExtractorProcess, Transport};
