//! Session-management wire format.
//!
//! Connect and disconnect handshakes travel over a dedicated UDP side
//! channel; the datapath never carries SM traffic. Packets are encoded with
//! a small hand-rolled little-endian codec since they are off the hot path
//! and variable-length (URIs travel in-band).

use crate::error::{Error, Result};

/// SM packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SmPktType {
    ConnectReq = 0,
    ConnectResp = 1,
    DisconnectReq = 2,
    DisconnectResp = 3,
}

impl TryFrom<u8> for SmPktType {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(SmPktType::ConnectReq),
            1 => Ok(SmPktType::ConnectResp),
            2 => Ok(SmPktType::DisconnectReq),
            3 => Ok(SmPktType::DisconnectResp),
            _ => Err(Error::InvalidSmPacket(format!("pkt type {}", v))),
        }
    }
}

/// Status carried by SM responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SmStatus {
    Success = 0,
    /// The destination endpoint id does not exist at the remote process.
    InvalidRemoteRpcId = 1,
    /// The remote endpoint is out of ring entries or memory.
    ResourceExhausted = 2,
    /// The remote endpoint could not resolve our routing info.
    RoutingResolutionFailed = 3,
}

impl TryFrom<u8> for SmStatus {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(SmStatus::Success),
            1 => Ok(SmStatus::InvalidRemoteRpcId),
            2 => Ok(SmStatus::ResourceExhausted),
            3 => Ok(SmStatus::RoutingResolutionFailed),
            _ => Err(Error::InvalidSmPacket(format!("status {}", v))),
        }
    }
}

/// One side of a handshake: who it is and how to reach its datapath.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SmEndpoint {
    /// `hostname:udp_port` of the SM socket.
    pub uri: String,
    pub rpc_id: u8,
    pub session_num: u16,
    /// Transport-specific datapath routing URI.
    pub routing_info: String,
}

/// A session-management datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SmPkt {
    pub pkt_type: SmPktType,
    pub status: SmStatus,
    /// Token generated by the client for connect-request deduplication.
    pub uniq_token: u64,
    pub client: SmEndpoint,
    pub server: SmEndpoint,
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn get_str(buf: &[u8], off: &mut usize) -> Result<String> {
    let len = u16::from_le_bytes(
        buf.get(*off..*off + 2)
            .ok_or_else(|| Error::InvalidSmPacket("truncated".into()))?
            .try_into()
            .unwrap(),
    ) as usize;
    *off += 2;
    let bytes = buf
        .get(*off..*off + len)
        .ok_or_else(|| Error::InvalidSmPacket("truncated".into()))?;
    *off += len;
    String::from_utf8(bytes.to_vec()).map_err(|_| Error::InvalidSmPacket("bad utf8".into()))
}

fn put_endpoint(out: &mut Vec<u8>, ep: &SmEndpoint) {
    put_str(out, &ep.uri);
    out.push(ep.rpc_id);
    out.extend_from_slice(&ep.session_num.to_le_bytes());
    put_str(out, &ep.routing_info);
}

fn get_endpoint(buf: &[u8], off: &mut usize) -> Result<SmEndpoint> {
    let uri = get_str(buf, off)?;
    let rpc_id = *buf
        .get(*off)
        .ok_or_else(|| Error::InvalidSmPacket("truncated".into()))?;
    *off += 1;
    let session_num = u16::from_le_bytes(
        buf.get(*off..*off + 2)
            .ok_or_else(|| Error::InvalidSmPacket("truncated".into()))?
            .try_into()
            .unwrap(),
    );
    *off += 2;
    let routing_info = get_str(buf, off)?;
    Ok(SmEndpoint {
        uri,
        rpc_id,
        session_num,
        routing_info,
    })
}

impl SmPkt {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.push(self.pkt_type as u8);
        out.push(self.status as u8);
        out.extend_from_slice(&self.uniq_token.to_le_bytes());
        put_endpoint(&mut out, &self.client);
        put_endpoint(&mut out, &self.server);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 10 {
            return Err(Error::InvalidSmPacket("truncated".into()));
        }
        let pkt_type = SmPktType::try_from(buf[0])?;
        let status = SmStatus::try_from(buf[1])?;
        let uniq_token = u64::from_le_bytes(buf[2..10].try_into().unwrap());
        let mut off = 10;
        let client = get_endpoint(buf, &mut off)?;
        let server = get_endpoint(buf, &mut off)?;
        Ok(Self {
            pkt_type,
            status,
            uniq_token,
            client,
            server,
        })
    }

    /// Build the response for a request, with fields echoed.
    pub fn response(&self, pkt_type: SmPktType, status: SmStatus) -> Self {
        Self {
            pkt_type,
            status,
            ..self.clone()
        }
    }
}

/// Event delivered to the application's SM handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmEventType {
    /// The session completed its connect handshake.
    Connected,
    /// The connect handshake failed with the given status.
    ConnectFailed(SmStatus),
    /// The session completed its disconnect handshake.
    Disconnected,
    /// The session was torn down after a remote failure; in-flight
    /// continuations have been failed.
    Reset,
}

/// A session-management event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmEvent {
    pub session_num: u16,
    pub event: SmEventType,
}

/// Application callback for SM events.
pub type SmHandler = Box<dyn FnMut(SmEvent)>;

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SmPkt {
        SmPkt {
            pkt_type: SmPktType::ConnectReq,
            status: SmStatus::Success,
            uniq_token: 0xDEAD_BEEF_CAFE,
            client: SmEndpoint {
                uri: "127.0.0.1:31850".into(),
                rpc_id: 3,
                session_num: 7,
                routing_info: "127.0.0.1:40001".into(),
            },
            server: SmEndpoint {
                uri: "127.0.0.1:31851".into(),
                rpc_id: 5,
                session_num: 0,
                routing_info: String::new(),
            },
        }
    }

    #[test]
    fn test_codec_roundtrip() {
        let pkt = sample();
        let bytes = pkt.encode();
        let back = SmPkt::decode(&bytes).unwrap();
        assert_eq!(pkt, back);
    }

    #[test]
    fn test_decode_truncated() {
        let bytes = sample().encode();
        for cut in [0, 5, 9, bytes.len() - 1] {
            assert!(SmPkt::decode(&bytes[..cut]).is_err());
        }
    }

    #[test]
    fn test_response_echoes_fields() {
        let req = sample();
        let resp = req.response(SmPktType::ConnectResp, SmStatus::ResourceExhausted);
        assert_eq!(resp.pkt_type, SmPktType::ConnectResp);
        assert_eq!(resp.status, SmStatus::ResourceExhausted);
        assert_eq!(resp.uniq_token, req.uniq_token);
        assert_eq!(resp.client, req.client);
    }

    #[test]
    fn test_decode_bad_type() {
        let mut bytes = sample().encode();
        bytes[0] = 99;
        assert!(SmPkt::decode(&bytes).is_err());
    }
}
