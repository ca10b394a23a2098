pub mod chat;
pub mod roster;
pub mod wire;

pub use chat::{ChatHistory, ChatMessage, Role, StreamEvent};
pub use roster::{AgentPresence, AgentProfile, Session, AGENTS};
pub use wire::{
    decode, encode, CodecError, ConnectionStatus, Envelope, EventFrame, RequestFrame,
    ResponseFrame,
};
