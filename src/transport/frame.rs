//! # Colon-delimited text frames.
//!
//! Every frame on the control transport is short text terminated by
//! [`TERMINATOR`]. Tagged frames start with a one-letter type:
//!
//! ```text
//! P:<pid>:<parent_pid>:<identifier>   process registration
//! S:<name>                            spawn child node
//! C:<name>                            spawn command process
//! R:<text>                            action response ("OK" = success)
//! T:<arg_count>:<pid>:<command>       client command request
//! F:<path>                            dependency file (feature pipe, newline-terminated)
//! ```
//!
//! Untagged frames (bare pid, exit status, `<client_pid>:<arg_count>`) have
//! dedicated helpers.

use crate::error::FrameError;

/// Byte terminating every frame on the control transport.
pub const TERMINATOR: u8 = 0;

/// Action response text signalling success.
pub const ACTION_OK: &str = "OK";

/// A tagged protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `P:` a process announcing itself.
    Registration {
        /// Process id of the sender.
        pid: i32,
        /// Process id of the process it forked from (`0` for the root).
        parent_pid: i32,
        /// Node name, empty for command processes.
        identifier: String,
    },
    /// `S:` fork a child node.
    SpawnNode(String),
    /// `C:` fork a command process.
    SpawnCommand(String),
    /// `R:` result of running an action.
    ActionResponse(String),
    /// `T:` a client asking to run a command.
    ClientRequest {
        /// Number of argument frames that follow.
        arg_count: usize,
        /// Client process id.
        pid: i32,
        /// Requested command name or alias.
        command: String,
    },
    /// `F:` a dependency file loaded by the process.
    Feature(String),
}

impl Frame {
    /// Renders the frame body (without terminator).
    pub fn encode(&self) -> String {
        match self {
            Frame::Registration {
                pid,
                parent_pid,
                identifier,
            } => format!("P:{pid}:{parent_pid}:{identifier}"),
            Frame::SpawnNode(name) => format!("S:{name}"),
            Frame::SpawnCommand(name) => format!("C:{name}"),
            Frame::ActionResponse(text) => format!("R:{text}"),
            Frame::ClientRequest {
                arg_count,
                pid,
                command,
            } => format!("T:{arg_count}:{pid}:{command}"),
            Frame::Feature(path) => format!("F:{path}"),
        }
    }

    /// Parses any tagged frame.
    pub fn parse(frame: &str) -> Result<Frame, FrameError> {
        let (tag, body) = frame.split_once(':').ok_or_else(|| FrameError::Malformed {
            frame: frame.to_string(),
            detail: "missing type separator",
        })?;
        match tag {
            "P" => {
                let mut parts = body.splitn(3, ':');
                let pid = parse_int(frame, parts.next(), "invalid pid")?;
                let parent_pid = parse_int(frame, parts.next(), "invalid parent pid")?;
                let identifier = parts.next().ok_or_else(|| FrameError::Malformed {
                    frame: frame.to_string(),
                    detail: "missing identifier",
                })?;
                Ok(Frame::Registration {
                    pid,
                    parent_pid,
                    identifier: identifier.to_string(),
                })
            }
            "S" => Ok(Frame::SpawnNode(body.to_string())),
            "C" => Ok(Frame::SpawnCommand(body.to_string())),
            "R" => Ok(Frame::ActionResponse(body.to_string())),
            "T" => {
                let mut parts = body.splitn(3, ':');
                let arg_count = parse_int(frame, parts.next(), "expected argument count")?;
                let pid = parse_int(frame, parts.next(), "expected pid")?;
                let command = parts.next().ok_or_else(|| FrameError::Malformed {
                    frame: frame.to_string(),
                    detail: "missing command name",
                })?;
                Ok(Frame::ClientRequest {
                    arg_count,
                    pid,
                    command: command.to_string(),
                })
            }
            "F" => Ok(Frame::Feature(body.trim().to_string())),
            _ => Err(FrameError::Malformed {
                frame: frame.to_string(),
                detail: "unknown frame type",
            }),
        }
    }

    /// Parses a frame and checks that it carries the `expected` tag.
    pub fn parse_expecting(frame: &str, expected: &'static str) -> Result<Frame, FrameError> {
        if frame.split(':').next() != Some(expected) {
            return Err(FrameError::UnexpectedTag {
                expected,
                frame: frame.to_string(),
            });
        }
        Frame::parse(frame)
    }
}

/// Parses a `P:` frame into `(pid, parent_pid, identifier)`.
pub fn parse_registration(frame: &str) -> Result<(i32, i32, String), FrameError> {
    match Frame::parse_expecting(frame, "P")? {
        Frame::Registration {
            pid,
            parent_pid,
            identifier,
        } => Ok((pid, parent_pid, identifier)),
        _ => unreachable!("parse_expecting checked the tag"),
    }
}

/// Parses an `R:` frame into `Ok(())` for `OK` or `Err(text)` otherwise.
pub fn parse_action_response(frame: &str) -> Result<Result<(), String>, FrameError> {
    match Frame::parse_expecting(frame, "R")? {
        Frame::ActionResponse(text) if text == ACTION_OK => Ok(Ok(())),
        Frame::ActionResponse(text) => Ok(Err(text)),
        _ => unreachable!("parse_expecting checked the tag"),
    }
}

/// Parses one line of the feature side channel.
///
/// Lines carrying the `F:` tag yield their path; untagged lines are taken as a
/// bare path. Blank lines yield `None`.
pub fn parse_feature_line(line: &str) -> Option<String> {
    let line = line.trim_end_matches(['\n', '\r']);
    let path = match line.strip_prefix("F:") {
        Some(path) => path.trim(),
        None => line.trim(),
    };
    (!path.is_empty()).then(|| path.to_string())
}

/// Renders the hand-off frame sent to a new command process.
pub fn encode_client_handoff(client_pid: i32, arg_count: usize) -> String {
    format!("{client_pid}:{arg_count}")
}

/// Parses `<client_pid>:<arg_count>`.
pub fn parse_client_handoff(frame: &str) -> Result<(i32, usize), FrameError> {
    let (pid, count) = frame.split_once(':').ok_or_else(|| FrameError::Malformed {
        frame: frame.to_string(),
        detail: "expected <pid>:<arg_count>",
    })?;
    let pid = parse_int(frame, Some(pid), "invalid client pid")?;
    let count = parse_int(frame, Some(count), "invalid argument count")?;
    Ok((pid, count))
}

/// Rejects text that would be split by the terminator.
pub fn check_frame(text: &str) -> Result<(), FrameError> {
    if text.as_bytes().contains(&TERMINATOR) {
        return Err(FrameError::ContainsTerminator {
            frame: text.to_string(),
        });
    }
    Ok(())
}

fn parse_int<T: std::str::FromStr>(
    frame: &str,
    part: Option<&str>,
    detail: &'static str,
) -> Result<T, FrameError> {
    part.and_then(|p| p.trim().parse().ok())
        .ok_or_else(|| FrameError::Malformed {
            frame: frame.to_string(),
            detail,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_keeps_colons_in_identifier() {
        let frame = Frame::parse("P:42:7:db:replica").unwrap();
        assert_eq!(
            frame,
            Frame::Registration {
                pid: 42,
                parent_pid: 7,
                identifier: "db:replica".into()
            }
        );
        assert_eq!(frame.encode(), "P:42:7:db:replica");
    }

    #[test]
    fn registration_with_empty_identifier() {
        assert_eq!(parse_registration("P:99:98:").unwrap(), (99, 98, String::new()));
    }

    #[test]
    fn registration_rejects_missing_fields() {
        assert!(matches!(
            parse_registration("P:12"),
            Err(FrameError::Malformed { .. })
        ));
        assert!(matches!(
            parse_registration("P:abc:1:x"),
            Err(FrameError::Malformed { detail: "invalid pid", .. })
        ));
    }

    #[test]
    fn wrong_tag_is_reported() {
        let err = parse_registration("R:OK").unwrap_err();
        assert_eq!(err.as_label(), "frame_unexpected_tag");
    }

    #[test]
    fn action_response_ok_and_error() {
        assert_eq!(parse_action_response("R:OK").unwrap(), Ok(()));
        assert_eq!(
            parse_action_response("R:boom: undefined method").unwrap(),
            Err("boom: undefined method".to_string())
        );
    }

    #[test]
    fn client_request_parses() {
        let frame = Frame::parse("T:2:4242:console").unwrap();
        assert_eq!(
            frame,
            Frame::ClientRequest {
                arg_count: 2,
                pid: 4242,
                command: "console".into()
            }
        );
        assert!(Frame::parse("T:x:1:console").is_err());
    }

    #[test]
    fn spawn_frames_encode() {
        assert_eq!(Frame::SpawnNode("code".into()).encode(), "S:code");
        assert_eq!(Frame::SpawnCommand("rake".into()).encode(), "C:rake");
        assert_eq!(Frame::parse("C:rake").unwrap(), Frame::SpawnCommand("rake".into()));
    }

    #[test]
    fn feature_lines() {
        assert_eq!(parse_feature_line("F:/app/code.rb\n"), Some("/app/code.rb".into()));
        assert_eq!(parse_feature_line("/app/bare.rb\n"), Some("/app/bare.rb".into()));
        assert_eq!(parse_feature_line("\n"), None);
        assert_eq!(parse_feature_line("F:\n"), None);
    }

    #[test]
    fn client_handoff() {
        assert_eq!(encode_client_handoff(10, 3), "10:3");
        assert_eq!(parse_client_handoff("10:3").unwrap(), (10, 3));
        assert!(parse_client_handoff("10").is_err());
    }

    #[test]
    fn terminator_rejected() {
        assert!(check_frame("ok").is_ok());
        assert!(check_frame("").is_ok());
        assert!(check_frame("a\0b").is_err());
    }
}
