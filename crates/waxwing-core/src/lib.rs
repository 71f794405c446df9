#![doc = include_str!("../README.md")]
#![forbid(unsafe_op_in_unsafe_fn)]

mod chan0;
mod channel;
mod connection;
mod ctx;
mod error;
mod feeder;
mod frame;
mod listener;
mod mime;
mod pool;
mod profile;
mod reader;
mod rt;
mod sequencer;
mod transport;

pub use channel::{Channel, ChannelStatus, CloseNotifyFn, FrameReceivedFn, Message};
pub use connection::{ConnOptions, Connection, RemoteGreeting, Role, StartOptions};
pub use ctx::{AutomaticMime, Ctx, CtxOptions};
pub use error::{Error, FrameError, ReplyCode, Result};
pub use feeder::{FeederHandle, FeederStatus, FileFeeder, PayloadFeeder};
pub use frame::{
    DEFAULT_MAX_FRAME_SIZE, DEFAULT_WINDOW, Decoded, Frame, FrameType, MAX_MSGNO, SeqFrame, decode,
};
pub use listener::{Listener, PortShare};
pub use mime::{
    BEEP_XML_CONTENT_TYPE, DEFAULT_CONTENT_TYPE, DEFAULT_TRANSFER_ENCODING, MimeHeaders,
};
pub use pool::ChannelPool;
pub use profile::{CloseDecision, Profile, ProfileBuilder, ProfileRegistry, StartDecision};
pub use rt::{
    AsyncQueue, EventAction, Timer, WorkerPool, WorkerPoolConfig, WorkerPoolStats,
};
pub use transport::{Transport, TransportKind};
