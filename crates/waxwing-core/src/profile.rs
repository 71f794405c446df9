//! Profile contract and per-context registry.
//!
//! A profile is the URI-identified sub-protocol run by a channel. The
//! core consults the registry on incoming `<start>` requests and hands
//! reassembled messages to the owning profile's `on_frame`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::channel::{Channel, Message};
use crate::error::ReplyCode;
use crate::mime::MimeHeaders;

/// Outcome of a start request, decided by the profile.
#[derive(Clone, Debug)]
pub enum StartDecision {
    /// Accept the channel, optionally piggybacking reply content inside
    /// the `<profile>` element.
    Accept { content: Option<String> },
    /// Refuse with an RFC 3080 reply code.
    Refuse { code: ReplyCode, message: String },
}

impl StartDecision {
    pub fn accept() -> StartDecision {
        StartDecision::Accept { content: None }
    }

    pub fn refuse(code: ReplyCode, message: impl Into<String>) -> StartDecision {
        StartDecision::Refuse {
            code,
            message: message.into(),
        }
    }
}

/// Outcome of a close request, decided by the profile or a
/// channel-level close handler.
#[derive(Clone, Debug)]
pub enum CloseDecision {
    Accept,
    Refuse { code: ReplyCode, message: String },
}

impl CloseDecision {
    pub fn refuse(code: ReplyCode, message: impl Into<String>) -> CloseDecision {
        CloseDecision::Refuse {
            code,
            message: message.into(),
        }
    }
}

/// A URI-identified sub-protocol.
///
/// All hooks have workable defaults: starts are accepted, closes are
/// accepted once the channel has no outstanding exchanges, and frames
/// are logged and dropped.
pub trait Profile: Send + Sync + 'static {
    fn uri(&self) -> &str;

    /// MIME defaults applied to messages sent on channels of this
    /// profile.
    fn mime_defaults(&self) -> Option<MimeHeaders> {
        None
    }

    /// Incoming `<start>` for this profile. `piggyback` is the content
    /// of the requesting `<profile>` element, if any.
    fn on_start(&self, channel: &Channel, piggyback: Option<&str>) -> StartDecision {
        let _ = (channel, piggyback);
        StartDecision::accept()
    }

    /// Incoming `<close>` for a channel of this profile.
    fn on_close(&self, channel: &Channel) -> CloseDecision {
        if channel.outstanding_messages() > 0 {
            CloseDecision::refuse(
                ReplyCode::ACTION_NOT_ALLOWED,
                "channel still has pending exchanges",
            )
        } else {
            CloseDecision::Accept
        }
    }

    /// A reassembled message (or raw frame, when the channel's complete
    /// flag is off) arrived on a channel of this profile.
    fn on_frame(&self, channel: &Channel, message: &Message) {
        tracing::warn!(
            channel = channel.number(),
            profile = self.uri(),
            msgno = message.msgno,
            "message dropped: profile installs no frame handler"
        );
    }
}

/// Per-context mapping from profile URI to its contract holder.
///
/// Entries are held behind `Arc`, so a registration stays valid for
/// channels that captured it even if later unregistered.
pub struct ProfileRegistry {
    entries: RwLock<HashMap<String, Arc<dyn Profile>>>,
}

impl ProfileRegistry {
    pub fn new() -> ProfileRegistry {
        ProfileRegistry {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register a profile. Returns `false` when a previous registration
    /// under the same URI was replaced.
    pub fn register(&self, profile: Arc<dyn Profile>) -> bool {
        self.entries
            .write()
            .insert(profile.uri().to_string(), profile)
            .is_none()
    }

    pub fn unregister(&self, uri: &str) -> bool {
        self.entries.write().remove(uri).is_some()
    }

    pub fn lookup(&self, uri: &str) -> Option<Arc<dyn Profile>> {
        self.entries.read().get(uri).cloned()
    }

    pub fn is_registered(&self, uri: &str) -> bool {
        self.entries.read().contains_key(uri)
    }

    /// Registered URIs, in no particular order.
    pub fn uris(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        ProfileRegistry::new()
    }
}

type StartFn = dyn Fn(&Channel, Option<&str>) -> StartDecision + Send + Sync;
type CloseFn = dyn Fn(&Channel) -> CloseDecision + Send + Sync;
type FrameFn = dyn Fn(&Channel, &Message) + Send + Sync;

/// Closure-based profile construction, for callers that do not want a
/// dedicated type per profile.
pub struct ProfileBuilder {
    uri: String,
    mime: Option<MimeHeaders>,
    on_start: Option<Box<StartFn>>,
    on_close: Option<Box<CloseFn>>,
    on_frame: Option<Box<FrameFn>>,
}

impl ProfileBuilder {
    pub fn new(uri: impl Into<String>) -> ProfileBuilder {
        ProfileBuilder {
            uri: uri.into(),
            mime: None,
            on_start: None,
            on_close: None,
            on_frame: None,
        }
    }

    pub fn mime_defaults(mut self, headers: MimeHeaders) -> Self {
        self.mime = Some(headers);
        self
    }

    pub fn on_start<F>(mut self, f: F) -> Self
    where
        F: Fn(&Channel, Option<&str>) -> StartDecision + Send + Sync + 'static,
    {
        self.on_start = Some(Box::new(f));
        self
    }

    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&Channel) -> CloseDecision + Send + Sync + 'static,
    {
        self.on_close = Some(Box::new(f));
        self
    }

    pub fn on_frame<F>(mut self, f: F) -> Self
    where
        F: Fn(&Channel, &Message) + Send + Sync + 'static,
    {
        self.on_frame = Some(Box::new(f));
        self
    }

    pub fn build(self) -> Arc<dyn Profile> {
        Arc::new(FnProfile {
            uri: self.uri,
            mime: self.mime,
            on_start: self.on_start,
            on_close: self.on_close,
            on_frame: self.on_frame,
        })
    }
}

struct FnProfile {
    uri: String,
    mime: Option<MimeHeaders>,
    on_start: Option<Box<StartFn>>,
    on_close: Option<Box<CloseFn>>,
    on_frame: Option<Box<FrameFn>>,
}

impl Profile for FnProfile {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn mime_defaults(&self) -> Option<MimeHeaders> {
        self.mime.clone()
    }

    fn on_start(&self, channel: &Channel, piggyback: Option<&str>) -> StartDecision {
        match &self.on_start {
            Some(f) => f(channel, piggyback),
            None => StartDecision::accept(),
        }
    }

    fn on_close(&self, channel: &Channel) -> CloseDecision {
        match &self.on_close {
            Some(f) => f(channel),
            None => {
                if channel.outstanding_messages() > 0 {
                    CloseDecision::refuse(
                        ReplyCode::ACTION_NOT_ALLOWED,
                        "channel still has pending exchanges",
                    )
                } else {
                    CloseDecision::Accept
                }
            }
        }
    }

    fn on_frame(&self, channel: &Channel, message: &Message) {
        match &self.on_frame {
            Some(f) => f(channel, message),
            None => {
                tracing::warn!(
                    channel = channel.number(),
                    profile = self.uri(),
                    "message dropped: no frame handler installed"
                );
            }
        }
    }
}
