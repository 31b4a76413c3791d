pub mod endpoint;
pub mod global_egress_ip;
