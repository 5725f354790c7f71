//! Live packet capture.
//!
//! A libpcap handle on a blocking thread lifts TCP segments out of captured
//! frames and feeds them to the async assembler over a channel. Header
//! parsing is deliberately small: Ethernet (one optional 802.1Q tag), IPv4
//! without options handling beyond the IHL, IPv6 without extension headers,
//! then TCP. Anything else is not broker traffic and is dropped.

use bytes::Bytes;
use pcap::{Active, Capture};
use tokio::sync::mpsc;
use tracing::{debug, error};

use kafkatap_common::{Error, FlowKey, Result};

const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;
const IP_PROTO_TCP: u8 = 6;

const TCP_FLAG_FIN: u8 = 0x01;
const TCP_FLAG_SYN: u8 = 0x02;
const TCP_FLAG_RST: u8 = 0x04;

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub interface: String,
    pub snaplen: i32,
    pub filter: String,
}

/// One TCP segment lifted out of a captured frame.
#[derive(Debug, Clone)]
pub struct Segment {
    pub flow: FlowKey,
    pub seq: u32,
    pub payload: Bytes,
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
}

/// Opens the live capture handle. Failures here are fatal configuration
/// problems, surfaced before the capture thread starts.
pub fn open(config: &CaptureConfig) -> Result<Capture<Active>> {
    let mut capture = Capture::from_device(config.interface.as_str())
        .map_err(|e| Error::Capture(e.to_string()))?
        .snaplen(config.snaplen)
        .promisc(true)
        .timeout(1000)
        .open()
        .map_err(|e| Error::Capture(e.to_string()))?;
    capture
        .filter(&config.filter, true)
        .map_err(|e| Error::Capture(e.to_string()))?;
    Ok(capture)
}

/// Capture loop; runs on a dedicated blocking thread. Ends when the
/// assembler side hangs up or the handle fails, dropping `tx` either way so
/// the main loop notices.
pub fn run(mut capture: Capture<Active>, tx: mpsc::Sender<Segment>) {
    loop {
        match capture.next_packet() {
            Ok(packet) => {
                let Some(segment) = parse_segment(packet.data) else {
                    continue;
                };
                debug!(
                    flow = %segment.flow,
                    seq = segment.seq,
                    len = segment.payload.len(),
                    "captured segment"
                );
                if tx.blocking_send(segment).is_err() {
                    return;
                }
            }
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(err) => {
                error!(error = %err, "packet capture failed");
                return;
            }
        }
    }
}

/// Parses an Ethernet frame down to its TCP segment, if that is what it
/// carries.
pub fn parse_segment(frame: &[u8]) -> Option<Segment> {
    if frame.len() < 14 {
        return None;
    }
    let mut ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    let mut offset = 14;
    if ethertype == ETHERTYPE_VLAN {
        if frame.len() < 18 {
            return None;
        }
        ethertype = u16::from_be_bytes([frame[16], frame[17]]);
        offset = 18;
    }

    let ip = &frame[offset..];
    let (src_ip, dst_ip, tcp) = match ethertype {
        ETHERTYPE_IPV4 => {
            if ip.len() < 20 || ip[0] >> 4 != 4 {
                return None;
            }
            let header_len = usize::from(ip[0] & 0x0f) * 4;
            let total_len = usize::from(u16::from_be_bytes([ip[2], ip[3]]));
            if header_len < 20 || total_len < header_len || ip.len() < header_len {
                return None;
            }
            if ip[9] != IP_PROTO_TCP {
                return None;
            }
            let src: [u8; 4] = ip[12..16].try_into().ok()?;
            let dst: [u8; 4] = ip[16..20].try_into().ok()?;
            // Ethernet pads short frames; the IP total length bounds the
            // real payload.
            let end = total_len.min(ip.len());
            (src.into(), dst.into(), &ip[header_len..end])
        }
        ETHERTYPE_IPV6 => {
            if ip.len() < 40 || ip[0] >> 4 != 6 {
                return None;
            }
            if ip[6] != IP_PROTO_TCP {
                return None;
            }
            let payload_len = usize::from(u16::from_be_bytes([ip[4], ip[5]]));
            let src: [u8; 16] = ip[8..24].try_into().ok()?;
            let dst: [u8; 16] = ip[24..40].try_into().ok()?;
            let end = (40 + payload_len).min(ip.len());
            (src.into(), dst.into(), &ip[40..end])
        }
        _ => return None,
    };

    if tcp.len() < 20 {
        return None;
    }
    let src_port = u16::from_be_bytes([tcp[0], tcp[1]]);
    let dst_port = u16::from_be_bytes([tcp[2], tcp[3]]);
    let seq = u32::from_be_bytes([tcp[4], tcp[5], tcp[6], tcp[7]]);
    let data_offset = usize::from(tcp[12] >> 4) * 4;
    if data_offset < 20 || tcp.len() < data_offset {
        return None;
    }
    let flags = tcp[13];

    Some(Segment {
        flow: FlowKey::new(src_ip, src_port, dst_ip, dst_port),
        seq,
        payload: Bytes::copy_from_slice(&tcp[data_offset..]),
        syn: flags & TCP_FLAG_SYN != 0,
        fin: flags & TCP_FLAG_FIN != 0,
        rst: flags & TCP_FLAG_RST != 0,
    })
}
