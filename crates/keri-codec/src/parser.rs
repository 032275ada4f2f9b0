//! Streaming message parser
//!
//! Bytes may arrive in arbitrary chunks. The parser buffers them and yields
//! whole messages as they complete; a short read leaves the buffer untouched
//! so the next `feed` can finish it. Malformed input cannot be resynchronized
//! within a stream, so the buffer is flushed and the error reported.
//!
//! A body that ends exactly at the end of the buffer is yielded without
//! attachments; senders write a message and its attachments in one piece.

use crate::attachments::Attachments;
use crate::error::{CodecError, Result};
use crate::serder::Serder;
use crate::version::{sniff, ColdStart};
use tracing::{debug, warn};

/// An event or receipt body with its attachment groups
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Body
    pub serder: Serder,
    /// Trailing attachments
    pub attachments: Attachments,
}

impl Message {
    /// Body followed by text attachments, optionally `-V` framed
    pub fn to_bytes(&self, framed: bool) -> Result<Vec<u8>> {
        let mut out = self.serder.raw().to_vec();
        let attachments = if framed {
            self.attachments.to_qb64_framed()?
        } else {
            self.attachments.to_qb64()?
        };
        out.extend_from_slice(attachments.as_bytes());
        Ok(out)
    }
}

/// Incremental parser over a byte stream
#[derive(Debug, Default)]
pub struct Parser {
    buffer: Vec<u8>,
}

impl Parser {
    /// Empty parser
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Buffered bytes not yet consumed
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Discard buffered bytes
    pub fn flush(&mut self) {
        if !self.buffer.is_empty() {
            warn!(discarded = self.buffer.len(), "Flushing message stream");
        }
        self.buffer.clear();
    }

    fn fail(&mut self, err: CodecError) -> Result<Option<Message>> {
        self.flush();
        Err(err)
    }

    /// Take the next complete message.
    ///
    /// `Ok(None)` means more bytes are needed.
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        let Some(first) = self.buffer.first().copied() else {
            return Ok(None);
        };
        match sniff(first) {
            Ok(ColdStart::Message(_)) => {}
            Ok(ColdStart::TextCounter | ColdStart::BinaryCounter) => {
                return self.fail(CodecError::attachment(
                    "attachments without a preceding message",
                ));
            }
            Err(err) => return self.fail(err),
        }

        let (serder, body_size) = match Serder::parse(&self.buffer) {
            Ok(parsed) => parsed,
            Err(err) if err.is_short() => return Ok(None),
            Err(err) => return self.fail(err),
        };

        let rest = &self.buffer[body_size..];
        let (attachments, attached_size) = match rest.first().map(|b| sniff(*b)) {
            None | Some(Ok(ColdStart::Message(_))) => (Attachments::default(), 0),
            Some(Ok(start)) => {
                let binary = start == ColdStart::BinaryCounter;
                match Attachments::parse(rest, binary) {
                    Ok(parsed) => parsed,
                    Err(err) if err.is_short() => return Ok(None),
                    Err(err) => return self.fail(err),
                }
            }
            Some(Err(err)) => return self.fail(err),
        };

        let consumed = body_size + attached_size;
        self.buffer.drain(..consumed);
        debug!(
            ilk = %serder.ilk(),
            kind = %serder.kind(),
            size = consumed,
            "Parsed message"
        );
        Ok(Some(Message {
            serder,
            attachments,
        }))
    }

    /// Take every complete message from a single buffer.
    ///
    /// Parsing stops at the first malformed message; its error is returned
    /// alongside the messages that preceded it.
    pub fn parse_all(bytes: &[u8]) -> (Vec<Message>, Option<CodecError>) {
        let mut parser = Parser::new();
        parser.feed(bytes);
        let mut messages = Vec::new();
        loop {
            match parser.next_message() {
                Ok(Some(message)) => messages.push(message),
                Ok(None) if parser.pending() == 0 => return (messages, None),
                Ok(None) => {
                    let need = parser.pending();
                    parser.flush();
                    return (messages, Some(CodecError::short(need)));
                }
                Err(err) => return (messages, Some(err)),
            }
        }
    }
}
