#![allow(dead_code)]

use std::net::SocketAddr;

use tether::{
    Arena, Client, Context, KEY_BYTES, MemoryNetwork, Message, MessageError, Server,
    ServerConfig, ServerInterface,
};

pub const KEY: [u8; KEY_BYTES] = [42; KEY_BYTES];
pub const FRAME: f64 = 1.0 / 60.0;

pub const SEQUENCE: u16 = 0;
pub const TEXT: u16 = 1;
pub const BLOB: u16 = 2;

/// Context that scrambles text payloads with a one-byte XOR key.
#[derive(Debug)]
pub struct Cipher(pub u8);

fn cipher_key(context: Option<&Context>) -> u8 {
    context
        .and_then(|context| context.downcast_ref::<Cipher>())
        .map_or(0, |cipher| cipher.0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestMessage {
    Sequence { value: u32 },
    Text(String),
    Blob { tag: u32 },
}

impl Message for TestMessage {
    fn create(message_type: u16) -> Option<Self> {
        match message_type {
            SEQUENCE => Some(Self::Sequence { value: 0 }),
            TEXT => Some(Self::Text(String::new())),
            BLOB => Some(Self::Blob { tag: 0 }),
            _ => None,
        }
    }

    fn message_type(&self) -> u16 {
        match self {
            Self::Sequence { .. } => SEQUENCE,
            Self::Text(_) => TEXT,
            Self::Blob { .. } => BLOB,
        }
    }

    fn serialize(&self, out: &mut Vec<u8>, context: Option<&Context>) {
        match self {
            Self::Sequence { value } | Self::Blob { tag: value } => {
                out.extend_from_slice(&value.to_le_bytes())
            }
            Self::Text(text) => {
                let key = cipher_key(context);
                out.extend(text.bytes().map(|byte| byte ^ key));
            }
        }
    }

    fn deserialize(&mut self, data: &[u8], context: Option<&Context>) -> Result<(), MessageError> {
        match self {
            Self::Sequence { value } | Self::Blob { tag: value } => {
                let bytes: [u8; 4] = data.try_into().map_err(|_| MessageError::Truncated {
                    needed: 4,
                    available: data.len(),
                })?;
                *value = u32::from_le_bytes(bytes);
            }
            Self::Text(text) => {
                let key = cipher_key(context);
                *text = String::from_utf8(data.iter().map(|byte| byte ^ key).collect())
                    .map_err(|_| MessageError::Invalid("text is not utf-8"))?;
            }
        }
        Ok(())
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn address() -> SocketAddr {
    "127.0.0.1:40000".parse().unwrap()
}

pub fn config() -> ServerConfig {
    ServerConfig {
        protocol_id: 0x7e7e,
        global_memory: 4 * 1024 * 1024,
        per_client_memory: 4 * 1024 * 1024,
        ..Default::default()
    }
}

pub type Received = (TestMessage, Option<Vec<u8>>);

/// A server and its clients on one in-memory network, stepped in lockstep.
pub struct Harness {
    pub network: MemoryNetwork,
    pub allocator: Arena,
    pub server: Server<TestMessage>,
    pub clients: Vec<Client<TestMessage>>,
    pub time: f64,
    config: ServerConfig,
    next_client_id: u64,
}

impl Harness {
    pub fn start(max_clients: usize, config: ServerConfig) -> Self {
        init_logging();
        let network = MemoryNetwork::new();
        let allocator = Arena::new("test", 1 << 30);
        let mut server = Server::new(
            allocator.clone(),
            KEY,
            address(),
            config.clone(),
            Box::new(network.clone()),
            0.0,
        );
        server.start(max_clients).unwrap();

        Self {
            network,
            allocator,
            server,
            clients: Vec::new(),
            time: 0.0,
            config,
            next_client_id: 1,
        }
    }

    /// Adds a client that starts connecting now. Returns its position in
    /// `clients`.
    pub fn add_client_with_key(&mut self, key: &[u8; KEY_BYTES]) -> usize {
        let client_config = self.config.client_config();
        let transport = self.network.connect(
            address(),
            key,
            self.next_client_id,
            &client_config,
            self.time,
        );
        self.next_client_id += 1;
        let client =
            Client::new(&self.allocator, client_config, Box::new(transport), self.time).unwrap();
        self.clients.push(client);
        self.clients.len() - 1
    }

    pub fn add_client(&mut self) -> usize {
        self.add_client_with_key(&KEY)
    }

    pub fn connect_clients(&mut self, count: usize) {
        let first = self.clients.len();
        for _ in 0..count {
            self.add_client();
        }
        let connected = self.run_until(60, |harness| {
            harness.clients[first..].iter().all(Client::is_connected)
        });
        assert!(connected, "clients failed to connect");
    }

    /// The server slot assigned to `clients[client]`.
    pub fn server_index(&self, client: usize) -> usize {
        self.clients[client].client_index().unwrap()
    }

    pub fn step(&mut self) {
        self.server.receive_packets();
        for client in &mut self.clients {
            client.receive_packets();
        }
        self.server.send_packets();
        for client in &mut self.clients {
            client.send_packets();
        }
        self.time += FRAME;
        self.server.advance_time(self.time);
        for client in &mut self.clients {
            client.advance_time(self.time);
        }
    }

    pub fn run(&mut self, frames: usize) {
        for _ in 0..frames {
            self.step();
        }
    }

    pub fn run_until(&mut self, max_frames: usize, mut done: impl FnMut(&mut Self) -> bool) -> bool {
        for _ in 0..max_frames {
            if done(self) {
                return true;
            }
            self.step();
        }
        done(self)
    }
}

pub fn client_send(client: &mut Client<TestMessage>, channel: usize, message: TestMessage, block: Option<&[u8]>) {
    let handle = client.create_message(message.message_type()).unwrap();
    *client.message_mut(handle).unwrap() = message;
    if let Some(bytes) = block {
        let mut block = client.allocate_block(bytes.len()).unwrap();
        block.copy_from_slice(bytes);
        client.attach_block(handle, block);
    }
    client.send_message(channel, handle);
    client.release_message(handle);
}

pub fn server_send(
    server: &mut Server<TestMessage>,
    client_index: usize,
    channel: usize,
    message: TestMessage,
    block: Option<&[u8]>,
) {
    let handle = server
        .create_message(client_index, message.message_type())
        .unwrap();
    *server.message_mut(client_index, handle).unwrap() = message;
    if let Some(bytes) = block {
        let mut block = server.allocate_block(client_index, bytes.len()).unwrap();
        block.copy_from_slice(bytes);
        server.attach_block(client_index, handle, block);
    }
    server.send_message(client_index, channel, handle);
    server.release_message(client_index, handle);
}

pub fn drain_server(server: &mut Server<TestMessage>, client_index: usize, channel: usize) -> Vec<Received> {
    let mut received = Vec::new();
    while let Some(handle) = server.receive_message(client_index, channel) {
        let message = server.message(client_index, handle).cloned().unwrap();
        let block = server.message_block(client_index, handle).map(<[u8]>::to_vec);
        server.release_message(client_index, handle);
        received.push((message, block));
    }
    received
}

pub fn drain_client(client: &mut Client<TestMessage>, channel: usize) -> Vec<Received> {
    let mut received = Vec::new();
    while let Some(handle) = client.receive_message(channel) {
        let message = client.message(handle).cloned().unwrap();
        let block = client.message_block(handle).map(<[u8]>::to_vec);
        client.release_message(handle);
        received.push((message, block));
    }
    received
}

pub fn sequence_values(received: &[Received]) -> Vec<u32> {
    received
        .iter()
        .map(|(message, _)| match message {
            TestMessage::Sequence { value } => *value,
            other => panic!("unexpected message {other:?}"),
        })
        .collect()
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}
