pub mod checksum;
pub mod ether;
pub mod packet;
pub mod tcp;

pub use packet::{OffloadInfo, Packet};

/// IP protocol number carried in offload descriptors and pseudo headers.
pub const IP_PROTO_TCP: u8 = 6;
