pub mod func_listener;
pub mod packet_listener;

pub use func_listener::start_func_listener;
pub use packet_listener::start_packet_listener;
