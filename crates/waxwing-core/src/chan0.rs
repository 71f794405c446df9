//! Channel-management protocol on channel 0.
//!
//! Small XML documents from the RFC 3080 channel-management DTD:
//! `<greeting>`, `<start>`, `<profile>`, `<close>`, `<ok>` and
//! `<error>`, exchanged as `application/beep+xml` messages. Requests
//! are strictly ordered (one outstanding at a time); this module parses
//! and emits the documents and processes the peer's requests, while the
//! initiating side of start/close lives on [`crate::Connection`].

use std::sync::Arc;

use bytes::Bytes;
use xml::reader::{ParserConfig, XmlEvent};
use xml::writer::{EmitterConfig, XmlEvent as WriterEvent};

use crate::channel::{Channel, ChannelStatus, Message, MsgnoMode2};
use crate::connection::{ConnectionInner, CtlReply, RemoteGreeting};
use crate::error::{Error, ReplyCode, Result};
use crate::frame::FrameType;
use crate::mime::{BEEP_XML_CONTENT_TYPE, MimeHeaders};
use crate::profile::{CloseDecision, StartDecision};

/// Content transfer encoding of a `<profile>` element's content.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ContentEncoding {
    None,
    Base64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct StartProfile {
    pub(crate) uri: String,
    pub(crate) encoding: ContentEncoding,
    pub(crate) content: Option<String>,
}

/// One parsed channel-management document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Chan0Message {
    Greeting {
        features: Option<String>,
        localize: Option<String>,
        profiles: Vec<String>,
    },
    Start {
        number: u32,
        server_name: Option<String>,
        profiles: Vec<StartProfile>,
    },
    ProfileReply {
        uri: String,
        content: Option<String>,
    },
    Close {
        number: u32,
        code: ReplyCode,
        text: Option<String>,
    },
    Ok,
    Error {
        code: ReplyCode,
        lang: Option<String>,
        text: String,
    },
}

/// MIME headers of every channel-management message.
pub(crate) fn management_mime() -> MimeHeaders {
    let mut headers = MimeHeaders::new();
    headers.set("Content-Type", BEEP_XML_CONTENT_TYPE);
    headers
}

// ---- parsing ------------------------------------------------------------

struct Node {
    name: String,
    attrs: Vec<(String, String)>,
    text: String,
    children: Vec<Node>,
}

impl Node {
    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    fn content(&self) -> Option<String> {
        if self.text.is_empty() {
            None
        } else {
            Some(self.text.clone())
        }
    }
}

fn parse_tree(bytes: &[u8]) -> Result<Node> {
    let reader = ParserConfig::new()
        .trim_whitespace(true)
        .ignore_comments(true)
        .cdata_to_characters(true)
        .create_reader(bytes);

    let mut stack: Vec<Node> = Vec::new();
    let mut root: Option<Node> = None;
    for event in reader {
        let event =
            event.map_err(|e| Error::Protocol(format!("channel-management XML: {}", e)))?;
        match event {
            XmlEvent::StartElement {
                name, attributes, ..
            } => {
                if root.is_some() {
                    return Err(Error::Protocol(
                        "multiple channel-management root elements".to_string(),
                    ));
                }
                stack.push(Node {
                    name: name.local_name,
                    attrs: attributes
                        .into_iter()
                        .map(|a| (a.name.local_name, a.value))
                        .collect(),
                    text: String::new(),
                    children: Vec::new(),
                });
            }
            XmlEvent::Characters(text) => {
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&text);
                }
            }
            XmlEvent::EndElement { .. } => {
                let node = stack.pop().ok_or_else(|| {
                    Error::Protocol("unbalanced channel-management XML".to_string())
                })?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => root = Some(node),
                }
            }
            XmlEvent::EndDocument => break,
            _ => {}
        }
    }
    root.ok_or_else(|| Error::Protocol("empty channel-management document".to_string()))
}

fn parse_code(node: &Node) -> Result<ReplyCode> {
    let text = node
        .attr("code")
        .ok_or_else(|| Error::Protocol(format!("<{}> without code", node.name)))?;
    ReplyCode::parse(text)
        .ok_or_else(|| Error::Protocol(format!("<{}> with non-numeric code", node.name)))
}

fn parse_number(node: &Node) -> Result<u32> {
    let text = node
        .attr("number")
        .ok_or_else(|| Error::Protocol(format!("<{}> without number", node.name)))?;
    let number: u64 = text
        .parse()
        .map_err(|_| Error::Protocol(format!("<{}> with bad number", node.name)))?;
    if number > i32::MAX as u64 {
        return Err(Error::Protocol(format!(
            "<{}> number out of range",
            node.name
        )));
    }
    Ok(number as u32)
}

fn parse_profile(node: &Node) -> Result<StartProfile> {
    let uri = node
        .attr("uri")
        .ok_or_else(|| Error::Protocol("<profile> without uri".to_string()))?
        .to_string();
    let encoding = match node.attr("encoding") {
        None | Some("none") => ContentEncoding::None,
        Some("base64") => ContentEncoding::Base64,
        Some(_) => {
            return Err(Error::Protocol("<profile> with unknown encoding".to_string()));
        }
    };
    Ok(StartProfile {
        uri,
        encoding,
        content: node.content(),
    })
}

/// Parse one channel-management document.
pub(crate) fn parse(bytes: &[u8]) -> Result<Chan0Message> {
    let root = parse_tree(bytes)?;
    match root.name.as_str() {
        "greeting" => {
            let mut profiles = Vec::new();
            for child in &root.children {
                if child.name != "profile" {
                    return Err(Error::Protocol(format!(
                        "<greeting> with unexpected <{}>",
                        child.name
                    )));
                }
                profiles.push(parse_profile(child)?.uri);
            }
            Ok(Chan0Message::Greeting {
                features: root.attr("features").map(str::to_string),
                localize: root.attr("localize").map(str::to_string),
                profiles,
            })
        }
        "start" => {
            let number = parse_number(&root)?;
            let mut profiles = Vec::new();
            for child in &root.children {
                if child.name != "profile" {
                    return Err(Error::Protocol(format!(
                        "<start> with unexpected <{}>",
                        child.name
                    )));
                }
                profiles.push(parse_profile(child)?);
            }
            if profiles.is_empty() {
                return Err(Error::Protocol("<start> without profiles".to_string()));
            }
            Ok(Chan0Message::Start {
                number,
                server_name: root.attr("serverName").map(str::to_string),
                profiles,
            })
        }
        "profile" => {
            let profile = parse_profile(&root)?;
            Ok(Chan0Message::ProfileReply {
                uri: profile.uri,
                content: profile.content,
            })
        }
        "close" => Ok(Chan0Message::Close {
            number: parse_number(&root)?,
            code: parse_code(&root)?,
            text: root.content(),
        }),
        "ok" => Ok(Chan0Message::Ok),
        "error" => Ok(Chan0Message::Error {
            code: parse_code(&root)?,
            lang: root.attr("lang").map(str::to_string),
            text: root.content().unwrap_or_default(),
        }),
        other => Err(Error::Protocol(format!(
            "unknown channel-management element <{}>",
            other
        ))),
    }
}

// ---- emission -----------------------------------------------------------

fn writer_for(out: &mut Vec<u8>) -> xml::writer::EventWriter<&mut Vec<u8>> {
    EmitterConfig::new()
        .write_document_declaration(false)
        .create_writer(out)
}

const WRITE_MSG: &str = "writing channel-management XML to memory";

pub(crate) fn greeting_xml(
    profiles: &[String],
    features: Option<&str>,
    localize: Option<&str>,
) -> Bytes {
    let mut out = Vec::new();
    {
        let mut writer = writer_for(&mut out);
        let mut greeting = WriterEvent::start_element("greeting");
        if let Some(features) = features {
            greeting = greeting.attr("features", features);
        }
        if let Some(localize) = localize {
            greeting = greeting.attr("localize", localize);
        }
        writer.write(greeting).expect(WRITE_MSG);
        for uri in profiles {
            writer
                .write(WriterEvent::start_element("profile").attr("uri", uri))
                .expect(WRITE_MSG);
            writer.write(WriterEvent::end_element()).expect(WRITE_MSG);
        }
        writer.write(WriterEvent::end_element()).expect(WRITE_MSG);
    }
    Bytes::from(out)
}

pub(crate) fn start_xml(
    number: u32,
    server_name: Option<&str>,
    profile_uri: &str,
    content: Option<&str>,
) -> Bytes {
    let number = number.to_string();
    let mut out = Vec::new();
    {
        let mut writer = writer_for(&mut out);
        let mut start = WriterEvent::start_element("start").attr("number", &number);
        if let Some(server_name) = server_name {
            start = start.attr("serverName", server_name);
        }
        writer.write(start).expect(WRITE_MSG);
        writer
            .write(WriterEvent::start_element("profile").attr("uri", profile_uri))
            .expect(WRITE_MSG);
        if let Some(content) = content {
            writer.write(WriterEvent::cdata(content)).expect(WRITE_MSG);
        }
        writer.write(WriterEvent::end_element()).expect(WRITE_MSG);
        writer.write(WriterEvent::end_element()).expect(WRITE_MSG);
    }
    Bytes::from(out)
}

pub(crate) fn profile_xml(uri: &str, content: Option<&str>) -> Bytes {
    let mut out = Vec::new();
    {
        let mut writer = writer_for(&mut out);
        writer
            .write(WriterEvent::start_element("profile").attr("uri", uri))
            .expect(WRITE_MSG);
        if let Some(content) = content {
            writer.write(WriterEvent::cdata(content)).expect(WRITE_MSG);
        }
        writer.write(WriterEvent::end_element()).expect(WRITE_MSG);
    }
    Bytes::from(out)
}

pub(crate) fn close_xml(number: u32, code: ReplyCode) -> Bytes {
    let number = number.to_string();
    let code = code.to_string();
    let mut out = Vec::new();
    {
        let mut writer = writer_for(&mut out);
        writer
            .write(
                WriterEvent::start_element("close")
                    .attr("number", &number)
                    .attr("code", &code),
            )
            .expect(WRITE_MSG);
        writer.write(WriterEvent::end_element()).expect(WRITE_MSG);
    }
    Bytes::from(out)
}

pub(crate) fn ok_xml() -> Bytes {
    Bytes::from_static(b"<ok />")
}

pub(crate) fn error_xml(code: ReplyCode, text: &str) -> Bytes {
    let code = code.to_string();
    let mut out = Vec::new();
    {
        let mut writer = writer_for(&mut out);
        writer
            .write(WriterEvent::start_element("error").attr("code", &code))
            .expect(WRITE_MSG);
        if !text.is_empty() {
            writer.write(WriterEvent::characters(text)).expect(WRITE_MSG);
        }
        writer.write(WriterEvent::end_element()).expect(WRITE_MSG);
    }
    Bytes::from(out)
}

// ---- inbound processing -------------------------------------------------

/// Process one reassembled channel-0 message.
pub(crate) fn handle_message(conn: &Arc<ConnectionInner>, message: Message) -> Result<()> {
    let doc = parse(&message.payload)?;
    tracing::trace!(kind = %message.kind, doc = ?doc, "channel 0 document");

    match (message.kind, doc) {
        (FrameType::Rpy, Chan0Message::Greeting {
            features,
            localize,
            profiles,
        }) => {
            if conn.greeting_done() {
                return Err(Error::Protocol("unexpected second greeting".to_string()));
            }
            conn.greeting_arrived(Ok(RemoteGreeting {
                profiles,
                features,
                localize,
            }));
            Ok(())
        }
        (FrameType::Err, Chan0Message::Error { code, text, .. }) if !conn.greeting_done() => {
            conn.greeting_arrived(Err(Error::GreetingFailed {
                code,
                message: text,
            }));
            Ok(())
        }
        (FrameType::Msg, Chan0Message::Start {
            number,
            server_name,
            profiles,
        }) => handle_start(conn, message.msgno, number, server_name, profiles),
        (FrameType::Msg, Chan0Message::Close { number, code, text }) => {
            handle_close(conn, message.msgno, number, code, text)
        }
        (FrameType::Rpy, Chan0Message::ProfileReply { uri, content }) => {
            conn.ctl_reply(message.msgno, CtlReply::Profile { uri, content });
            Ok(())
        }
        (FrameType::Rpy, Chan0Message::Ok) => {
            conn.ctl_reply(message.msgno, CtlReply::Ok);
            Ok(())
        }
        (FrameType::Err, Chan0Message::Error { code, text, .. }) => {
            conn.ctl_reply(message.msgno, CtlReply::Refused { code, text });
            Ok(())
        }
        (kind, doc) => Err(Error::Protocol(format!(
            "unexpected channel-management exchange: {} carrying {:?}",
            kind, doc
        ))),
    }
}

fn reply(conn: &Arc<ConnectionInner>, kind: FrameType, msgno: u32, body: Bytes) -> Result<()> {
    conn.channel0()
        .send_management(kind, MsgnoMode2::Exact(msgno), body, management_mime())
        .map(|_| ())
}

fn handle_start(
    conn: &Arc<ConnectionInner>,
    msgno: u32,
    number: u32,
    server_name: Option<String>,
    profiles: Vec<StartProfile>,
) -> Result<()> {
    if let Err(refusal) = conn.check_peer_channel_number(number) {
        return reply(
            conn,
            FrameType::Err,
            msgno,
            error_xml(ReplyCode::PARAMETER_INVALID, &refusal),
        );
    }
    if let Some(server_name) = server_name {
        conn.note_server_name(server_name);
    }

    let mut refusal: Option<(ReplyCode, String)> = None;
    for requested in &profiles {
        let Some(profile) = conn.ctx.profiles().lookup(&requested.uri) else {
            continue;
        };
        if requested.encoding == ContentEncoding::Base64 {
            refusal = Some((
                ReplyCode::PARAMETER_NOT_IMPLEMENTED,
                "base64 piggyback encoding not supported".to_string(),
            ));
            continue;
        }

        let channel = Channel::create(
            number,
            requested.uri.clone(),
            Some(profile.clone()),
            Arc::downgrade(conn),
            ChannelStatus::Open,
        );
        match profile.on_start(&channel, requested.content.as_deref()) {
            StartDecision::Accept { content } => {
                conn.insert_channel(channel.clone());
                reply(
                    conn,
                    FrameType::Rpy,
                    msgno,
                    profile_xml(&requested.uri, content.as_deref()),
                )?;
                // the start handler may have queued sends before the
                // channel was in the table
                if channel.has_sendable() {
                    conn.wake_channel(number);
                }
                conn.ctx.notify_channel_added(&channel);
                tracing::debug!(
                    channel = number,
                    profile = %requested.uri,
                    "accepted channel start"
                );
                return Ok(());
            }
            StartDecision::Refuse { code, message } => {
                refusal = Some((code, message));
            }
        }
    }

    let (code, text) = refusal.unwrap_or((
        ReplyCode::ACTION_NOT_ALLOWED,
        "profile not supported".to_string(),
    ));
    tracing::debug!(channel = number, code = %code, "refused channel start");
    reply(conn, FrameType::Err, msgno, error_xml(code, &text))
}

fn handle_close(
    conn: &Arc<ConnectionInner>,
    msgno: u32,
    number: u32,
    code: ReplyCode,
    text: Option<String>,
) -> Result<()> {
    tracing::debug!(channel = number, code = %code, text = ?text, "peer requested close");

    if number == 0 {
        // session release: agree, drain the ok, drop the transport
        reply(conn, FrameType::Rpy, msgno, ok_xml())?;
        conn.shutdown_when_flushed();
        return Ok(());
    }

    let Some(channel) = conn.get_channel(number) else {
        return reply(
            conn,
            FrameType::Err,
            msgno,
            error_xml(ReplyCode::PARAMETER_INVALID, "no such channel"),
        );
    };

    channel.set_status(ChannelStatus::ClosingIn);
    let decision = match channel.close_handler() {
        Some(handler) => handler(&channel),
        None => match conn.ctx.close_fallback() {
            Some(handler) => handler(&channel),
            None => match channel.profile() {
                Some(profile) => profile.on_close(&channel),
                None => CloseDecision::Accept,
            },
        },
    };

    match decision {
        CloseDecision::Accept => {
            reply(conn, FrameType::Rpy, msgno, ok_xml())?;
            channel.mark_dead();
            conn.remove_channel(number);
            conn.ctx.notify_channel_removed(&channel);
            Ok(())
        }
        CloseDecision::Refuse { code, message } => {
            channel.set_status(ChannelStatus::Open);
            reply(conn, FrameType::Err, msgno, error_xml(code, &message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_roundtrip() {
        let profiles = vec![
            "urn:x-test:echo".to_string(),
            "urn:x-test:sink".to_string(),
        ];
        let xml = greeting_xml(&profiles, Some("tls"), None);
        match parse(&xml).unwrap() {
            Chan0Message::Greeting {
                features,
                localize,
                profiles: parsed,
            } => {
                assert_eq!(features.as_deref(), Some("tls"));
                assert_eq!(localize, None);
                assert_eq!(parsed, profiles);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn empty_greeting_is_legal() {
        let xml = greeting_xml(&[], None, None);
        match parse(&xml).unwrap() {
            Chan0Message::Greeting { profiles, .. } => assert!(profiles.is_empty()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn start_roundtrip_with_piggyback() {
        let xml = start_xml(3, Some("bay.example"), "urn:x-test:echo", Some("<cfg/>"));
        match parse(&xml).unwrap() {
            Chan0Message::Start {
                number,
                server_name,
                profiles,
            } => {
                assert_eq!(number, 3);
                assert_eq!(server_name.as_deref(), Some("bay.example"));
                assert_eq!(profiles.len(), 1);
                assert_eq!(profiles[0].uri, "urn:x-test:echo");
                assert_eq!(profiles[0].content.as_deref(), Some("<cfg/>"));
                assert_eq!(profiles[0].encoding, ContentEncoding::None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn start_without_profile_is_protocol_error() {
        assert!(parse(br#"<start number="1"></start>"#).is_err());
    }

    #[test]
    fn start_accepts_multiple_profiles() {
        let doc = br#"<start number="5"><profile uri="urn:a" /><profile uri="urn:b" /></start>"#;
        match parse(doc).unwrap() {
            Chan0Message::Start { profiles, .. } => {
                assert_eq!(profiles.len(), 2);
                assert_eq!(profiles[1].uri, "urn:b");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn profile_reply_roundtrip() {
        let xml = profile_xml("urn:x-test:echo", Some("ready"));
        match parse(&xml).unwrap() {
            Chan0Message::ProfileReply { uri, content } => {
                assert_eq!(uri, "urn:x-test:echo");
                assert_eq!(content.as_deref(), Some("ready"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn close_roundtrip() {
        let xml = close_xml(7, ReplyCode::SUCCESS);
        assert_eq!(
            parse(&xml).unwrap(),
            Chan0Message::Close {
                number: 7,
                code: ReplyCode::SUCCESS,
                text: None,
            }
        );
    }

    #[test]
    fn ok_parses() {
        assert_eq!(parse(&ok_xml()).unwrap(), Chan0Message::Ok);
        assert_eq!(parse(b"<ok/>").unwrap(), Chan0Message::Ok);
    }

    #[test]
    fn error_roundtrip_escapes_text() {
        let xml = error_xml(ReplyCode::ACTION_NOT_ALLOWED, "no <such> profile & more");
        match parse(&xml).unwrap() {
            Chan0Message::Error { code, text, .. } => {
                assert_eq!(code, ReplyCode::ACTION_NOT_ALLOWED);
                assert_eq!(text, "no <such> profile & more");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn error_with_xml_lang() {
        let doc = br#"<error code="550" xml:lang="en">denied</error>"#;
        match parse(doc).unwrap() {
            Chan0Message::Error { code, lang, text } => {
                assert_eq!(code, ReplyCode(550));
                assert_eq!(lang.as_deref(), Some("en"));
                assert_eq!(text, "denied");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn bad_code_attribute_rejected() {
        assert!(parse(br#"<error code="5a0">x</error>"#).is_err());
        assert!(parse(br#"<error>x</error>"#).is_err());
    }

    #[test]
    fn unknown_element_rejected() {
        assert!(parse(b"<begone/>").is_err());
    }

    #[test]
    fn malformed_xml_rejected() {
        assert!(parse(b"<greeting>").is_err());
        assert!(parse(b"not xml at all").is_err());
    }

    #[test]
    fn start_number_bounds() {
        assert!(parse(br#"<start number="2147483648"><profile uri="urn:a"/></start>"#).is_err());
        assert!(parse(br#"<start number="-1"><profile uri="urn:a"/></start>"#).is_err());
    }
}
