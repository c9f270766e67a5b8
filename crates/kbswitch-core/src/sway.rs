// Kbswitch Sway Backend
// Input-source host and event stream over the sway/i3 IPC socket

use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use parking_lot::Mutex;
use serde::Deserialize;

use crate::source::{
    HostError, HostResult, InputSource, InputSourceHost, SourceEvent, SourceEventStream, SourceId,
};

const IPC_MAGIC: &[u8; 6] = b"i3-ipc";
const IPC_HEADER_LEN: usize = 14;

const MSG_RUN_COMMAND: u32 = 0;
const MSG_SUBSCRIBE: u32 = 2;
const MSG_GET_INPUTS: u32 = 100;
const EVENT_INPUT: u32 = 0x8000_0015;

/// One entry of a GET_INPUTS reply.
#[derive(Debug, Clone, Deserialize)]
struct IpcInput {
    #[allow(dead_code)]
    identifier: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    xkb_layout_names: Vec<String>,
    #[serde(default)]
    xkb_active_layout_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CommandOutcome {
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InputEventPayload {
    change: String,
}

fn socket_path() -> HostResult<PathBuf> {
    std::env::var_os("SWAYSOCK")
        .or_else(|| std::env::var_os("I3SOCK"))
        .map(PathBuf::from)
        .ok_or_else(|| HostError::Unavailable("SWAYSOCK is not set".to_string()))
}

fn encode_frame(kind: u32, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(IPC_HEADER_LEN + payload.len());
    frame.extend_from_slice(IPC_MAGIC);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&kind.to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Split one complete frame off the front of `buffer`, if present.
fn take_frame(buffer: &mut Vec<u8>) -> HostResult<Option<(u32, Vec<u8>)>> {
    if buffer.len() < IPC_HEADER_LEN {
        return Ok(None);
    }
    if &buffer[..6] != IPC_MAGIC {
        return Err(HostError::Protocol("bad IPC magic".to_string()));
    }

    let len = u32::from_le_bytes([buffer[6], buffer[7], buffer[8], buffer[9]]) as usize;
    let kind = u32::from_le_bytes([buffer[10], buffer[11], buffer[12], buffer[13]]);
    if buffer.len() < IPC_HEADER_LEN + len {
        return Ok(None);
    }

    let payload = buffer[IPC_HEADER_LEN..IPC_HEADER_LEN + len].to_vec();
    buffer.drain(..IPC_HEADER_LEN + len);
    Ok(Some((kind, payload)))
}

/// The seat's selectable sources: every configured layout of every
/// keyboard, in configuration order, first occurrence wins.
fn sources_from_inputs(inputs: &[IpcInput]) -> Vec<InputSource> {
    let mut sources: Vec<InputSource> = Vec::new();
    for input in inputs.iter().filter(|i| i.kind == "keyboard") {
        for name in &input.xkb_layout_names {
            let id = SourceId::new(name.clone());
            if sources.iter().all(|s| s.id != id) {
                sources.push(InputSource {
                    id,
                    name: name.clone(),
                });
            }
        }
    }
    sources
}

fn event_from_payload(payload: &[u8]) -> Option<SourceEvent> {
    let event: InputEventPayload = serde_json::from_slice(payload).ok()?;
    match event.change.as_str() {
        "xkb_layout" | "xkb_keymap" => Some(SourceEvent::LayoutChanged),
        "added" | "removed" => Some(SourceEvent::DevicesChanged),
        _ => None,
    }
}

struct IpcConnection {
    stream: UnixStream,
}

impl IpcConnection {
    fn connect() -> HostResult<Self> {
        let stream = UnixStream::connect(socket_path()?)?;
        Ok(Self { stream })
    }

    fn send(&mut self, kind: u32, payload: &[u8]) -> HostResult<()> {
        self.stream.write_all(&encode_frame(kind, payload))?;
        Ok(())
    }

    fn recv(&mut self) -> HostResult<(u32, Vec<u8>)> {
        let mut header = [0u8; IPC_HEADER_LEN];
        self.stream.read_exact(&mut header)?;
        if &header[..6] != IPC_MAGIC {
            return Err(HostError::Protocol("bad IPC magic".to_string()));
        }

        let len = u32::from_le_bytes([header[6], header[7], header[8], header[9]]) as usize;
        let kind = u32::from_le_bytes([header[10], header[11], header[12], header[13]]);
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload)?;
        Ok((kind, payload))
    }

    /// Send a request and wait for its reply, skipping any interleaved
    /// event frames.
    fn roundtrip(&mut self, kind: u32, payload: &[u8]) -> HostResult<Vec<u8>> {
        self.send(kind, payload)?;
        loop {
            let (reply_kind, reply) = self.recv()?;
            if reply_kind == kind {
                return Ok(reply);
            }
        }
    }
}

/// Input-source host over the sway/i3 IPC socket.
///
/// Sources are the configured XKB layout names of the seat's keyboards;
/// activation issues `xkb_switch_layout` for the layout's position. The
/// compositor confirms by emitting an `input` event, which arrives through
/// `SwayEvents`, never through the command reply.
pub struct SwayHost {
    conn: Mutex<IpcConnection>,
}

impl SwayHost {
    pub fn connect() -> HostResult<Self> {
        Ok(Self {
            conn: Mutex::new(IpcConnection::connect()?),
        })
    }

    fn get_inputs(&self) -> HostResult<Vec<IpcInput>> {
        let reply = self.conn.lock().roundtrip(MSG_GET_INPUTS, b"")?;
        serde_json::from_slice(&reply).map_err(|e| HostError::Protocol(e.to_string()))
    }

    fn run_command(&self, command: &str) -> HostResult<()> {
        let reply = self
            .conn
            .lock()
            .roundtrip(MSG_RUN_COMMAND, command.as_bytes())?;
        let outcomes: Vec<CommandOutcome> =
            serde_json::from_slice(&reply).map_err(|e| HostError::Protocol(e.to_string()))?;
        for outcome in outcomes {
            if !outcome.success {
                return Err(HostError::Protocol(
                    outcome.error.unwrap_or_else(|| "command failed".to_string()),
                ));
            }
        }
        Ok(())
    }
}

impl InputSourceHost for SwayHost {
    fn list_keyboard_sources(&self) -> HostResult<Vec<InputSource>> {
        Ok(sources_from_inputs(&self.get_inputs()?))
    }

    fn current(&self) -> HostResult<InputSource> {
        let inputs = self.get_inputs()?;
        inputs
            .iter()
            .filter(|i| i.kind == "keyboard")
            .find_map(|i| i.xkb_active_layout_name.clone())
            .map(|name| InputSource {
                id: SourceId::new(name.clone()),
                name,
            })
            .ok_or_else(|| HostError::Unavailable("no active keyboard layout".to_string()))
    }

    fn activate(&self, source: &InputSource) -> HostResult<()> {
        let inputs = self.get_inputs()?;
        let index = inputs
            .iter()
            .filter(|i| i.kind == "keyboard")
            .find_map(|i| {
                i.xkb_layout_names
                    .iter()
                    .position(|name| name.as_str() == source.id.as_str())
            })
            .ok_or_else(|| {
                HostError::Unavailable(format!("layout {} is not configured", source.id))
            })?;

        self.run_command(&format!("input type:keyboard xkb_switch_layout {index}"))
    }
}

/// Subscribed event connection delivering `input` events as a pollable fd.
///
/// A second connection, separate from the request socket: sway interleaves
/// events with replies on a subscribed socket, so commands and events each
/// get their own.
pub struct SwayEvents {
    stream: UnixStream,
    buffer: Vec<u8>,
}

impl SwayEvents {
    pub fn connect() -> HostResult<Self> {
        let mut conn = IpcConnection::connect()?;
        let reply = conn.roundtrip(MSG_SUBSCRIBE, br#"["input"]"#)?;
        let outcome: serde_json::Value =
            serde_json::from_slice(&reply).map_err(|e| HostError::Protocol(e.to_string()))?;
        if outcome.get("success").and_then(|v| v.as_bool()) != Some(true) {
            return Err(HostError::Protocol("subscription refused".to_string()));
        }

        conn.stream.set_nonblocking(true)?;
        Ok(Self {
            stream: conn.stream,
            buffer: Vec::new(),
        })
    }
}

impl SourceEventStream for SwayEvents {
    fn poll_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn drain(&mut self) -> HostResult<Vec<SourceEvent>> {
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(HostError::Protocol("event socket closed".to_string()));
                }
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }

        let mut events = Vec::new();
        while let Some((kind, payload)) = take_frame(&mut self.buffer)? {
            if kind != EVENT_INPUT {
                continue;
            }
            if let Some(event) = event_from_payload(&payload) {
                events.push(event);
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(kind: &str, layouts: &[&str], active: Option<&str>) -> IpcInput {
        IpcInput {
            identifier: "1:1:Test".to_string(),
            kind: kind.to_string(),
            xkb_layout_names: layouts.iter().map(|s| s.to_string()).collect(),
            xkb_active_layout_name: active.map(|s| s.to_string()),
        }
    }

    #[test]
    fn frame_round_trips() {
        let mut buffer = encode_frame(MSG_GET_INPUTS, b"[]");
        let (kind, payload) = take_frame(&mut buffer).unwrap().unwrap();
        assert_eq!(kind, MSG_GET_INPUTS);
        assert_eq!(payload, b"[]");
        assert!(buffer.is_empty());
    }

    #[test]
    fn partial_frame_is_left_in_buffer() {
        let frame = encode_frame(EVENT_INPUT, br#"{"change":"xkb_layout"}"#);
        let mut buffer = frame[..frame.len() - 3].to_vec();
        assert!(take_frame(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(&frame[frame.len() - 3..]);
        let (kind, _) = take_frame(&mut buffer).unwrap().unwrap();
        assert_eq!(kind, EVENT_INPUT);
    }

    #[test]
    fn two_frames_split_in_order() {
        let mut buffer = encode_frame(EVENT_INPUT, br#"{"change":"added"}"#);
        buffer.extend_from_slice(&encode_frame(EVENT_INPUT, br#"{"change":"xkb_layout"}"#));

        let (_, first) = take_frame(&mut buffer).unwrap().unwrap();
        assert_eq!(event_from_payload(&first), Some(SourceEvent::DevicesChanged));
        let (_, second) = take_frame(&mut buffer).unwrap().unwrap();
        assert_eq!(event_from_payload(&second), Some(SourceEvent::LayoutChanged));
        assert!(take_frame(&mut buffer).unwrap().is_none());
    }

    #[test]
    fn bad_magic_is_a_protocol_error() {
        let mut buffer = b"not-ipc\0\0\0\0\0\0\0".to_vec();
        assert!(take_frame(&mut buffer).is_err());
    }

    #[test]
    fn sources_come_from_keyboards_only() {
        let inputs = vec![
            input("pointer", &[], None),
            input("keyboard", &["English (US)", "German"], Some("English (US)")),
            input("keyboard", &["English (US)", "French"], Some("English (US)")),
        ];

        let sources = sources_from_inputs(&inputs);
        let ids: Vec<&str> = sources.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["English (US)", "German", "French"]);
    }

    #[test]
    fn irrelevant_event_changes_are_ignored() {
        assert_eq!(
            event_from_payload(br#"{"change":"libinput_config"}"#),
            None
        );
        assert_eq!(event_from_payload(b"not json"), None);
        assert_eq!(
            event_from_payload(br#"{"change":"xkb_keymap"}"#),
            Some(SourceEvent::LayoutChanged)
        );
        assert_eq!(
            event_from_payload(br#"{"change":"removed"}"#),
            Some(SourceEvent::DevicesChanged)
        );
    }
}
