//! Receive-record framing for the listener path
//!
//! Reads through the listener deliver a record made of a fixed-size
//! send/receive ancillary header followed by the message payload. The
//! header layout mirrors the kernel `sctp_sndrcvinfo` structure (32 bytes),
//! encoded here in network byte order.

use std::time::Duration;

use bytes::{Buf, BufMut};
use csfb_common::LISTENER_RECORD_HEADER_LEN;
use tokio::time::timeout;

use crate::endpoint::{AssociationId, EndpointHandle};
use crate::error::{Result, SessionError};

/// Size of the ancillary header prefixed to every listener record
pub const SNDRCVINFO_LEN: usize = LISTENER_RECORD_HEADER_LEN;

/// Per-message ancillary information
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SndRcvInfo {
    pub stream: u16,
    pub ssn: u16,
    pub flags: u16,
    pub ppid: u32,
    pub context: u32,
    pub ttl: u32,
    pub tsn: u32,
    pub cum_tsn: u32,
    pub assoc_id: i32,
}

impl SndRcvInfo {
    /// Writes the header, padded to [`SNDRCVINFO_LEN`] bytes.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16(self.stream);
        buf.put_u16(self.ssn);
        buf.put_u16(self.flags);
        buf.put_u16(0); // pad
        buf.put_u32(self.ppid);
        buf.put_u32(self.context);
        buf.put_u32(self.ttl);
        buf.put_u32(self.tsn);
        buf.put_u32(self.cum_tsn);
        buf.put_i32(self.assoc_id);
    }

    /// Parses a header from the front of `buf`.
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < SNDRCVINFO_LEN {
            return Err(SessionError::Receive(format!(
                "record of {} bytes is shorter than the {} byte header",
                buf.remaining(),
                SNDRCVINFO_LEN
            )));
        }

        let stream = buf.get_u16();
        let ssn = buf.get_u16();
        let flags = buf.get_u16();
        buf.advance(2);
        Ok(Self {
            stream,
            ssn,
            flags,
            ppid: buf.get_u32(),
            context: buf.get_u32(),
            ttl: buf.get_u32(),
            tsn: buf.get_u32(),
            cum_tsn: buf.get_u32(),
            assoc_id: buf.get_i32(),
        })
    }
}

/// Returns the payload part of a listener record.
pub fn strip_sndrcvinfo(record: &[u8]) -> Result<&[u8]> {
    record.get(SNDRCVINFO_LEN..).ok_or_else(|| {
        SessionError::Receive(format!(
            "record of {} bytes is shorter than the {} byte header",
            record.len(),
            SNDRCVINFO_LEN
        ))
    })
}

/// Reader that yields header-wrapped records for one association.
pub struct InfoWrappedConn {
    endpoint: EndpointHandle,
    association_id: AssociationId,
    receive_timeout: Option<Duration>,
}

impl InfoWrappedConn {
    pub fn new(
        endpoint: EndpointHandle,
        association_id: AssociationId,
        receive_timeout: Option<Duration>,
    ) -> Self {
        Self {
            endpoint,
            association_id,
            receive_timeout,
        }
    }

    /// Reads one record into `buf`, returning the number of bytes written.
    ///
    /// Fails with `MessageTooLarge` when header plus payload do not fit;
    /// the message is consumed in that case.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let message = match self.receive_timeout {
            Some(deadline) => timeout(deadline, self.endpoint.recv(self.association_id))
                .await
                .map_err(|_| SessionError::Receive(format!("no message within {deadline:?}")))??,
            None => self.endpoint.recv(self.association_id).await?,
        };

        let size = SNDRCVINFO_LEN + message.data.len();
        if size > buf.len() {
            return Err(SessionError::MessageTooLarge {
                size,
                capacity: buf.len(),
            });
        }

        let info = SndRcvInfo {
            stream: message.stream_id,
            ssn: message.ssn,
            ppid: message.ppid,
            assoc_id: i32::try_from(self.association_id).unwrap_or(i32::MAX),
            ..SndRcvInfo::default()
        };
        let (mut header, payload) = buf.split_at_mut(SNDRCVINFO_LEN);
        info.encode(&mut header);
        payload[..message.data.len()].copy_from_slice(&message.data);
        Ok(size)
    }
}
