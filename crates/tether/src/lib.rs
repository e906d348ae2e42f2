pub mod arena;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod message;
pub mod net;
pub mod server;

pub use arena::{Arena, ArenaUsage, Block};
pub use channel::ChannelError;
pub use client::{Client, ClientError};
pub use config::{
    ChannelConfig, ChannelKind, ClientConfig, ConfigError, ConnectionConfig, EndpointConfig,
    KEY_BYTES, MAX_CHANNELS, MAX_CLIENTS, PoolConfig, ServerConfig,
};
pub use connection::{Connection, ConnectionError};
pub use message::{Context, Message, MessageError, MessageHandle, MessagePool, PoolError};
pub use net::{
    ClientState, ClientTransport, MemoryClient, MemoryNetwork, MemoryServer, NetworkSimulator,
    NetworkStats, SecureTransport, SimulatorSettings, TransportFactory,
};
pub use server::{
    BaseServer, DisconnectReason, Server, ServerError, ServerEvent, ServerInterface,
};
