pub mod subnet;

pub use ipnetwork::Ipv4Network;
pub use subnet::{parse_network, SubnetManager, DEFAULT_SUPERNETS, SUBNET_PREFIX};
