//! The NATS core text protocol: parsing client operations and
//! encoding the operations the server sends back.

use serde::{Deserialize, Serialize};

pub(crate) const CRLF: &[u8] = b"\r\n";
pub(crate) const PONG: &[u8] = b"PONG\r\n";
pub(crate) const OK: &[u8] = b"+OK\r\n";

// Status block nats-server sends when a request has no responders.
const NO_RESPONDERS: &[u8] = b"NATS/1.0 503\r\n\r\n";

/// Protocol errors. The message is sent verbatim in `-ERR '<msg>'`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub(crate) enum ProtocolError {
    #[error("Unknown Protocol Operation")]
    UnknownOp,
    #[error("Maximum Control Line Exceeded")]
    ControlLineExceeded,
    #[error("Maximum Payload Violation")]
    MaxPayload,
    #[error("Invalid Subject")]
    InvalidSubject,
    #[error("Invalid Publish Subject")]
    InvalidPublishSubject,
    #[error("Invalid Queue Name")]
    InvalidQueue,
    #[error("Invalid CONNECT: {0}")]
    InvalidConnect(String),
    #[error("Parse Error: {0}")]
    Parse(String),
}

impl ProtocolError {
    /// Errors after which nats-server keeps the connection open.
    pub(crate) fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ProtocolError::InvalidSubject
                | ProtocolError::InvalidPublishSubject
                | ProtocolError::InvalidQueue
        )
    }

    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        format!("-ERR '{}'\r\n", self).into_bytes()
    }
}

/// Options a client sends in CONNECT. Keys we don't act on
/// (auth, pedantic, lang, version...) are ignored.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub(crate) struct ConnectInfo {
    pub verbose: bool,
    pub name: Option<String>,
    pub echo: bool,
    pub headers: bool,
    pub no_responders: bool,
}

impl Default for ConnectInfo {
    fn default() -> Self {
        Self {
            verbose: false,
            name: None,
            echo: true,
            headers: false,
            no_responders: false,
        }
    }
}

/// Body of the INFO greeting.
#[derive(Serialize, Debug, Clone)]
pub(crate) struct ServerInfo {
    pub server_id: String,
    pub server_name: String,
    pub version: String,
    pub proto: u8,
    pub host: String,
    pub port: u16,
    pub headers: bool,
    pub max_payload: usize,
    pub client_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
}

impl ServerInfo {
    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        // serializing a struct of plain fields can't fail
        let json = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_owned());
        format!("INFO {}\r\n", json).into_bytes()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ClientOp {
    Connect(ConnectInfo),
    Ping,
    Pong,
    Pub {
        subject: String,
        reply: Option<String>,
        size: usize,
    },
    HPub {
        subject: String,
        reply: Option<String>,
        header_size: usize,
        total_size: usize,
    },
    Sub {
        subject: String,
        queue: Option<String>,
        sid: String,
    },
    Unsub {
        sid: String,
        max: Option<u64>,
    },
}

fn parse_size(arg: &str) -> Result<usize, ProtocolError> {
    arg.parse::<usize>()
        .map_err(|_| ProtocolError::Parse(format!("invalid size {:?}", arg)))
}

/// Parses one control line with the trailing CRLF already stripped.
/// The payload of PUB/HPUB is read separately by the caller.
pub(crate) fn parse_op(line: &str) -> Result<ClientOp, ProtocolError> {
    let line = line.trim_start();
    let (op, rest) = match line.find(|c: char| c == ' ' || c == '\t') {
        Some(idx) => (&line[..idx], line[idx..].trim()),
        None => (line, ""),
    };
    let args: Vec<&str> = rest.split_whitespace().collect();

    match op.to_ascii_uppercase().as_str() {
        "CONNECT" => {
            let info = serde_json::from_str::<ConnectInfo>(rest)
                .map_err(|err| ProtocolError::InvalidConnect(err.to_string()))?;
            Ok(ClientOp::Connect(info))
        }
        "PING" => Ok(ClientOp::Ping),
        "PONG" => Ok(ClientOp::Pong),
        "PUB" => match args.as_slice() {
            [subject, size] => Ok(ClientOp::Pub {
                subject: subject.to_string(),
                reply: None,
                size: parse_size(size)?,
            }),
            [subject, reply, size] => Ok(ClientOp::Pub {
                subject: subject.to_string(),
                reply: Some(reply.to_string()),
                size: parse_size(size)?,
            }),
            _ => Err(ProtocolError::Parse(format!("PUB {}", rest))),
        },
        "HPUB" => {
            let (subject, reply, hdr, total) = match args.as_slice() {
                [subject, hdr, total] => (subject, None, hdr, total),
                [subject, reply, hdr, total] => (subject, Some(reply.to_string()), hdr, total),
                _ => return Err(ProtocolError::Parse(format!("HPUB {}", rest))),
            };
            let header_size = parse_size(hdr)?;
            let total_size = parse_size(total)?;
            if header_size > total_size {
                return Err(ProtocolError::Parse(format!(
                    "header size {} exceeds total size {}",
                    header_size, total_size
                )));
            }
            Ok(ClientOp::HPub {
                subject: subject.to_string(),
                reply,
                header_size,
                total_size,
            })
        }
        "SUB" => match args.as_slice() {
            [subject, sid] => Ok(ClientOp::Sub {
                subject: subject.to_string(),
                queue: None,
                sid: sid.to_string(),
            }),
            [subject, queue, sid] => Ok(ClientOp::Sub {
                subject: subject.to_string(),
                queue: Some(queue.to_string()),
                sid: sid.to_string(),
            }),
            _ => Err(ProtocolError::Parse(format!("SUB {}", rest))),
        },
        "UNSUB" => match args.as_slice() {
            [sid] => Ok(ClientOp::Unsub {
                sid: sid.to_string(),
                max: None,
            }),
            [sid, max] => {
                let max = max
                    .parse::<u64>()
                    .map_err(|_| ProtocolError::Parse(format!("invalid max {:?}", max)))?;
                Ok(ClientOp::Unsub {
                    sid: sid.to_string(),
                    max: Some(max),
                })
            }
            _ => Err(ProtocolError::Parse(format!("UNSUB {}", rest))),
        },
        _ => Err(ProtocolError::UnknownOp),
    }
}

/// `MSG <subject> <sid> [reply] <size>\r\n<payload>\r\n`
pub(crate) fn msg(subject: &str, sid: &str, reply: Option<&str>, payload: &[u8]) -> Vec<u8> {
    let head = match reply {
        Some(reply) => format!("MSG {} {} {} {}\r\n", subject, sid, reply, payload.len()),
        None => format!("MSG {} {} {}\r\n", subject, sid, payload.len()),
    };
    let mut buf = Vec::with_capacity(head.len() + payload.len() + 2);
    buf.extend_from_slice(head.as_bytes());
    buf.extend_from_slice(payload);
    buf.extend_from_slice(CRLF);
    buf
}

/// `HMSG <subject> <sid> [reply] <hdr size> <total size>\r\n<headers><payload>\r\n`
pub(crate) fn hmsg(
    subject: &str,
    sid: &str,
    reply: Option<&str>,
    headers: &[u8],
    payload: &[u8],
) -> Vec<u8> {
    let total = headers.len() + payload.len();
    let head = match reply {
        Some(reply) => format!(
            "HMSG {} {} {} {} {}\r\n",
            subject,
            sid,
            reply,
            headers.len(),
            total
        ),
        None => format!("HMSG {} {} {} {}\r\n", subject, sid, headers.len(), total),
    };
    let mut buf = Vec::with_capacity(head.len() + total + 2);
    buf.extend_from_slice(head.as_bytes());
    buf.extend_from_slice(headers);
    buf.extend_from_slice(payload);
    buf.extend_from_slice(CRLF);
    buf
}

pub(crate) fn no_responders(reply: &str, sid: &str) -> Vec<u8> {
    hmsg(reply, sid, None, NO_RESPONDERS, &[])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pub() {
        assert_eq!(
            parse_op("PUB test.subject 7").unwrap(),
            ClientOp::Pub {
                subject: "test.subject".into(),
                reply: None,
                size: 7
            }
        );
        assert_eq!(
            parse_op("pub foo _INBOX.1  3").unwrap(),
            ClientOp::Pub {
                subject: "foo".into(),
                reply: Some("_INBOX.1".into()),
                size: 3
            }
        );
        assert!(matches!(
            parse_op("PUB foo bar"),
            Err(ProtocolError::Parse(_))
        ));
        assert!(matches!(parse_op("PUB"), Err(ProtocolError::Parse(_))));
    }

    #[test]
    fn test_parse_hpub() {
        assert_eq!(
            parse_op("HPUB foo 12 17").unwrap(),
            ClientOp::HPub {
                subject: "foo".into(),
                reply: None,
                header_size: 12,
                total_size: 17
            }
        );
        assert!(parse_op("HPUB foo 20 17").is_err());
    }

    #[test]
    fn test_parse_sub_unsub() {
        assert_eq!(
            parse_op("SUB foo.* workers 42").unwrap(),
            ClientOp::Sub {
                subject: "foo.*".into(),
                queue: Some("workers".into()),
                sid: "42".into()
            }
        );
        assert_eq!(
            parse_op("UNSUB 42 5").unwrap(),
            ClientOp::Unsub {
                sid: "42".into(),
                max: Some(5)
            }
        );
        assert!(parse_op("UNSUB 42 many").is_err());
    }

    #[test]
    fn test_parse_connect() {
        let op = parse_op(
            r#"CONNECT {"verbose":true,"pedantic":false,"echo":false,"name":"t","lang":"rust"}"#,
        )
        .unwrap();
        match op {
            ClientOp::Connect(info) => {
                assert!(info.verbose);
                assert!(!info.echo);
                assert!(!info.headers);
                assert_eq!(info.name.as_deref(), Some("t"));
            }
            other => panic!("unexpected op {:?}", other),
        }
        assert!(matches!(
            parse_op("CONNECT {nope"),
            Err(ProtocolError::InvalidConnect(_))
        ));
    }

    #[test]
    fn test_parse_unknown() {
        assert_eq!(parse_op("FOO bar"), Err(ProtocolError::UnknownOp));
        assert_eq!(parse_op("ping").unwrap(), ClientOp::Ping);
    }

    #[test]
    fn test_encode_msg() {
        assert_eq!(
            msg("test.subject", "1", None, b"payload"),
            b"MSG test.subject 1 7\r\npayload\r\n".to_vec()
        );
        assert_eq!(
            msg("a", "2", Some("r"), b""),
            b"MSG a 2 r 0\r\n\r\n".to_vec()
        );
    }

    #[test]
    fn test_encode_no_responders() {
        assert_eq!(
            no_responders("_INBOX.x", "3"),
            b"HMSG _INBOX.x 3 16 16\r\nNATS/1.0 503\r\n\r\n\r\n".to_vec()
        );
    }

    #[test]
    fn test_err_line() {
        assert_eq!(
            ProtocolError::UnknownOp.to_bytes(),
            b"-ERR 'Unknown Protocol Operation'\r\n".to_vec()
        );
        assert!(ProtocolError::UnknownOp.is_fatal());
        assert!(!ProtocolError::InvalidSubject.is_fatal());
    }
}
