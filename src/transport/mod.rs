// MIT License - Copyright (c) 2021 TJForc

pub mod correlator;
pub mod discovery;
pub mod session;

pub use correlator::{PendingReply, RequestCorrelator};
pub use discovery::{DiscoveredDevice, discover};
pub use session::{DeviceSession, SessionState, SessionStatus};
