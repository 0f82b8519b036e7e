//! Application-level messages and the fragmentation state machine.
//!
//! The teacher's `Message::from_frame`/`to_frames` assumed a single frame
//! per message. This module adds the other half: `Assembler`, which folds
//! a stream of data and control frames (control frames may legally
//! interleave between the fragments of a data message) into complete
//! `Message`s, enforcing the message size limit incrementally rather than
//! only once the whole payload has already been buffered.

use crate::error::Error;
use crate::frame::{Frame, OpCode};

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

impl Message {
    pub fn as_binary(&self) -> &[u8] {
        match self {
            Message::Text(text) => text.as_bytes(),
            Message::Binary(data) => data,
        }
    }

    /// Splits a message into frames no larger than `max_frame_size`,
    /// using a Continuation opcode for every fragment after the first.
    pub fn to_frames(self, max_frame_size: usize) -> Vec<Frame> {
        let opcode = match &self {
            Message::Text(_) => OpCode::Text,
            Message::Binary(_) => OpCode::Binary,
        };
        let payload = match self {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(data) => data,
        };

        if payload.is_empty() {
            return vec![Frame::new(true, opcode, payload)];
        }

        let chunks: Vec<&[u8]> = payload.chunks(max_frame_size.max(1)).collect();
        let last = chunks.len() - 1;
        chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| {
                let frame_opcode = if i == 0 { opcode } else { OpCode::Continuation };
                Frame::new(i == last, frame_opcode, chunk.to_vec())
            })
            .collect()
    }
}

enum InProgress {
    Text(Vec<u8>),
    Binary(Vec<u8>),
}

/// Reassembles fragmented data frames into complete messages.
///
/// Only one data message may be fragmented at a time; control frames are
/// allowed to interleave between its fragments and are surfaced to the
/// caller immediately via `Assembled::Control`, independent of whatever
/// fragmentation is in progress.
pub struct Assembler {
    in_progress: Option<InProgress>,
    accumulated_len: usize,
    max_message_size: usize,
}

pub enum Assembled {
    Message(Message),
    Control(Frame),
    Incomplete,
}

impl Assembler {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            in_progress: None,
            accumulated_len: 0,
            max_message_size,
        }
    }

    /// Feeds one frame into the assembler. Returns a complete `Message`
    /// once a final fragment closes out a sequence, a `Control` frame
    /// immediately (these are never fragmented), or `Incomplete` while a
    /// data message is still being accumulated.
    pub fn push(&mut self, frame: Frame) -> Result<Assembled, Error> {
        if frame.opcode.is_control() {
            return Ok(Assembled::Control(frame));
        }

        match frame.opcode {
            OpCode::Text | OpCode::Binary => {
                if self.in_progress.is_some() {
                    return Err(Error::Protocol(
                        "new data frame received while a fragmented message is in progress".into(),
                    ));
                }
                self.accumulated_len = frame.payload.len();
                self.check_size()?;
                if frame.fin {
                    return self.finish(frame.opcode, frame.payload);
                }
                self.in_progress = Some(match frame.opcode {
                    OpCode::Text => InProgress::Text(frame.payload),
                    OpCode::Binary => InProgress::Binary(frame.payload),
                    _ => unreachable!(),
                });
                Ok(Assembled::Incomplete)
            }
            OpCode::Continuation => {
                let opcode = match &self.in_progress {
                    Some(InProgress::Text(_)) => OpCode::Text,
                    Some(InProgress::Binary(_)) => OpCode::Binary,
                    None => {
                        return Err(Error::Protocol(
                            "continuation frame received with no message in progress".into(),
                        ))
                    }
                };

                self.accumulated_len += frame.payload.len();
                self.check_size()?;

                let buf = match self.in_progress.as_mut().unwrap() {
                    InProgress::Text(buf) | InProgress::Binary(buf) => buf,
                };
                buf.extend_from_slice(&frame.payload);

                if frame.fin {
                    let payload = match self.in_progress.take().unwrap() {
                        InProgress::Text(buf) | InProgress::Binary(buf) => buf,
                    };
                    return self.finish(opcode, payload);
                }
                Ok(Assembled::Incomplete)
            }
            _ => unreachable!("control opcodes are handled above"),
        }
    }

    fn check_size(&mut self) -> Result<(), Error> {
        if self.accumulated_len > self.max_message_size {
            self.in_progress = None;
            self.accumulated_len = 0;
            return Err(Error::MessageTooBig);
        }
        Ok(())
    }

    fn finish(&mut self, opcode: OpCode, payload: Vec<u8>) -> Result<Assembled, Error> {
        self.accumulated_len = 0;
        let message = match opcode {
            OpCode::Text => Message::Text(String::from_utf8(payload)?),
            OpCode::Binary => Message::Binary(payload),
            _ => unreachable!(),
        };
        Ok(Assembled::Message(message))
    }
}
