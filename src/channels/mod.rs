//! Channel backends behind one send contract.

pub mod channel;
pub mod cloud_api;
pub mod evolution;

pub use channel::{
    ChannelAdapter, ChannelCredentials, ChannelKind, ChannelRouter, InboundEvent, InboundMedia,
    MediaAttachment, MediaKind, OutboundContent, SendFailure, SendResult, WebhookBatch,
    normalize_phone,
};
pub use cloud_api::CloudApiAdapter;
pub use evolution::EvolutionAdapter;
