pub mod memory;
pub mod packet;
pub mod reliable;
pub mod sequence;
mod simulator;
mod stats;
mod transport;

pub use memory::{MemoryClient, MemoryNetwork, MemoryServer};
pub use packet::PacketError;
pub use reliable::{Endpoint, ReliableEndpoint};
pub use sequence::{SequenceBuffer, sequence_greater_than, sequence_less_than};
pub use simulator::{NetworkSimulator, SimulatorSettings};
pub use stats::{NetworkStats, RttEstimator};
pub use transport::{ClientState, ClientTransport, SecureTransport, TransportFactory};
