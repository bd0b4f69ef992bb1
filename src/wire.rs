//! Binary websocket framing for kernel messages.
//!
//! Jupyter kernel messages travel over the websocket as a single binary
//! frame per message, using an offset-table layout documented in the
//! `jupyter-server` project's [websocket protocol
//! docs](https://jupyter-server.readthedocs.io/en/latest/developers/websocket-protocols.html):
//!
//! ```text
//! 0: offset_number (n+1)
//! 8: offset_0
//! 16: offset_1
//! ...
//! 8*offset_number: offset_n
//! offset_0: channel
//! offset_1: header
//! offset_2: parent_header
//! offset_3: metadata
//! offset_4: content
//! offset_5: buffer_0
//! (offset_6: buffer_1 ... and so on)
//! ```
//!
//! All integers are little-endian. Each websocket binary frame decodes to
//! exactly one kernel message.

use bytes::Bytes;

use crate::message::{Channel, Message};
use crate::{Error, Result};

/// Serialize a message into a binary websocket payload.
pub fn to_ws_payload(msg: &Message) -> Result<Vec<u8>> {
    let offset_number = 5 + msg.buffers.len() as u64;
    let offset_0 = 8 * (offset_number + 1);
    let mut offsets = vec![offset_number];

    let mut payload = Vec::new();

    // offset_0: channel
    offsets.push(offset_0 + payload.len() as u64);
    payload.extend_from_slice(msg.channel.as_str().as_bytes());

    // offset_1: header
    offsets.push(offset_0 + payload.len() as u64);
    payload.extend(
        serde_json::to_vec(&msg.header).map_err(|err| Error::InvalidResponse(err.to_string()))?,
    );

    // offset_2: parent_header
    offsets.push(offset_0 + payload.len() as u64);
    payload.extend(
        serde_json::to_vec(&msg.parent_header)
            .map_err(|err| Error::InvalidResponse(err.to_string()))?,
    );

    // offset_3: metadata
    offsets.push(offset_0 + payload.len() as u64);
    payload.extend(
        serde_json::to_vec(&msg.metadata).map_err(|err| Error::InvalidResponse(err.to_string()))?,
    );

    // offset_4: content
    offsets.push(offset_0 + payload.len() as u64);
    payload.extend(
        serde_json::to_vec(&msg.content).map_err(|err| Error::InvalidResponse(err.to_string()))?,
    );

    for buffer in &msg.buffers {
        offsets.push(offset_0 + payload.len() as u64);
        payload.extend_from_slice(buffer);
    }

    Ok(offsets
        .into_iter()
        .flat_map(|n| n.to_le_bytes())
        .chain(payload)
        .collect())
}

/// Deserialize a binary websocket payload into a message, including which
/// channel it was framed for.
pub fn from_ws_payload(payload: &[u8]) -> Result<Message> {
    let bad = || Error::InvalidResponse("malformed websocket frame".to_string());

    let offset_number: usize = u64::from_le_bytes(
        payload
            .get(0..8)
            .ok_or_else(bad)?
            .try_into()
            .map_err(|_| bad())?,
    )
    .try_into()
    .map_err(|_| bad())?;

    let mut offsets = Vec::with_capacity(offset_number);
    for i in 0..offset_number {
        let index = 8 * (i + 1);
        let slice = payload.get(index..index + 8).ok_or_else(bad)?;
        offsets.push(
            u64::from_le_bytes(slice.try_into().map_err(|_| bad())?)
                .try_into()
                .map_err(|_| bad())?,
        );
    }
    offsets.push(payload.len());

    let seg = |i: usize| -> Result<&[u8]> {
        let (start, end) = (
            *offsets.get(i).ok_or_else(bad)?,
            *offsets.get(i + 1).ok_or_else(bad)?,
        );
        payload.get(start..end).ok_or_else(bad)
    };

    let channel_str = std::str::from_utf8(seg(0)?).map_err(|_| bad())?;
    let channel: Channel = channel_str.parse()?;
    let header =
        serde_json::from_slice(seg(1)?).map_err(|err| Error::InvalidResponse(err.to_string()))?;
    let parent_header =
        serde_json::from_slice(seg(2)?).map_err(|err| Error::InvalidResponse(err.to_string()))?;
    let metadata = serde_json::from_slice(seg(3)?).unwrap_or_default();
    let content =
        serde_json::from_slice(seg(4)?).map_err(|err| Error::InvalidResponse(err.to_string()))?;

    let mut buffers = Vec::new();
    for i in 5..offset_number {
        buffers.push(Bytes::from(seg(i)?.to_vec()));
    }

    Ok(Message {
        header,
        parent_header,
        channel,
        content,
        metadata,
        buffers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::KernelMessageType;
    use serde_json::json;

    #[test]
    fn round_trips_through_wire_framing() {
        let msg = Message::new(
            KernelMessageType::ExecuteRequest,
            Channel::Shell,
            "alice",
            "session-1",
            json!({"code": "1 + 1"}),
        )
        .with_buffers(vec![Bytes::from_static(b"hello"), Bytes::from_static(b"world")]);

        let payload = to_ws_payload(&msg).unwrap();
        let decoded = from_ws_payload(&payload).unwrap();

        assert_eq!(decoded.channel, Channel::Shell);
        assert_eq!(decoded.header, msg.header);
        assert_eq!(decoded.content, msg.content);
        assert_eq!(decoded.buffers, msg.buffers);
    }

    #[test]
    fn rejects_truncated_frame() {
        let err = from_ws_payload(&[1, 2, 3]);
        assert!(err.is_err());
    }

    #[test]
    fn preserves_channel_across_all_four_channels() {
        for ch in [Channel::Shell, Channel::IoPub, Channel::Stdin, Channel::Control] {
            let msg = Message::new(
                KernelMessageType::Status,
                ch,
                "u",
                "s",
                json!({}),
            );
            let payload = to_ws_payload(&msg).unwrap();
            let decoded = from_ws_payload(&payload).unwrap();
            assert_eq!(decoded.channel, ch);
        }
    }
}
