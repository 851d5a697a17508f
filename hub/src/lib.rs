//! Hub side of the flash-sync system: the device command server, the file
//! transfer receiver, the UDP time responder and the operator status API.

pub mod command_server;
pub mod file_transfer;
pub mod status;
pub mod udp_time;

pub use command_server::CommandServer;
pub use file_transfer::FileTransferServer;
pub use udp_time::UdpTimeServer;
