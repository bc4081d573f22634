pub mod backoff;
pub mod listing;
pub mod session;
pub mod transfer;

pub use listing::RemoteObject;
pub use session::{DeviceConfig, DeviceError, DeviceSession};
pub use transfer::{TransferClient, TransferConfig, TransferError};
