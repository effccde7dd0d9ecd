//! Raw IPv6/TCP frame builders and parsers for exercising the datapath in
//! tests, acting as the host-kernel side of the TUN.

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    IpAddress, IpProtocol, Ipv6Packet, Ipv6Repr, TcpControl, TcpPacket, TcpRepr, TcpSeqNumber,
};
use std::net::Ipv6Addr;

pub(crate) struct TcpFrameSpec<'a> {
    pub src: (Ipv6Addr, u16),
    pub dst: (Ipv6Addr, u16),
    pub control: TcpControl,
    pub seq: i32,
    pub ack: Option<i32>,
    pub payload: &'a [u8],
}

pub(crate) fn build_tcp_frame(spec: &TcpFrameSpec<'_>) -> Vec<u8> {
    let tcp = TcpRepr {
        src_port: spec.src.1,
        dst_port: spec.dst.1,
        control: spec.control,
        seq_number: TcpSeqNumber(spec.seq),
        ack_number: spec.ack.map(TcpSeqNumber),
        window_len: 64240,
        window_scale: None,
        max_seg_size: None,
        sack_permitted: false,
        sack_ranges: [None, None, None],
        timestamp: None,
        payload: spec.payload,
    };
    let ip = Ipv6Repr {
        src_addr: spec.src.0,
        dst_addr: spec.dst.0,
        next_header: IpProtocol::Tcp,
        payload_len: tcp.buffer_len(),
        hop_limit: 64,
    };

    let mut buf = vec![0u8; ip.buffer_len() + tcp.buffer_len()];
    ip.emit(&mut Ipv6Packet::new_unchecked(&mut buf[..]));
    tcp.emit(
        &mut TcpPacket::new_unchecked(&mut buf[ip.buffer_len()..]),
        &IpAddress::Ipv6(spec.src.0),
        &IpAddress::Ipv6(spec.dst.0),
        &ChecksumCapabilities::default(),
    );
    buf
}

/// Initial SYN from a host-side client.
pub(crate) fn syn_frame(src: (Ipv6Addr, u16), dst: (Ipv6Addr, u16), seq: i32) -> Vec<u8> {
    build_tcp_frame(&TcpFrameSpec {
        src,
        dst,
        control: TcpControl::Syn,
        seq,
        ack: None,
        payload: &[],
    })
}

/// Bare ACK segment.
pub(crate) fn ack_frame(src: (Ipv6Addr, u16), dst: (Ipv6Addr, u16), seq: i32, ack: i32) -> Vec<u8> {
    build_tcp_frame(&TcpFrameSpec {
        src,
        dst,
        control: TcpControl::None,
        seq,
        ack: Some(ack),
        payload: &[],
    })
}

/// Data segment with PSH set.
pub(crate) fn data_frame(
    src: (Ipv6Addr, u16),
    dst: (Ipv6Addr, u16),
    seq: i32,
    ack: i32,
    payload: &[u8],
) -> Vec<u8> {
    build_tcp_frame(&TcpFrameSpec {
        src,
        dst,
        control: TcpControl::Psh,
        seq,
        ack: Some(ack),
        payload,
    })
}

/// FIN segment.
pub(crate) fn fin_frame(src: (Ipv6Addr, u16), dst: (Ipv6Addr, u16), seq: i32, ack: i32) -> Vec<u8> {
    build_tcp_frame(&TcpFrameSpec {
        src,
        dst,
        control: TcpControl::Fin,
        seq,
        ack: Some(ack),
        payload: &[],
    })
}

pub(crate) struct ParsedTcpFrame {
    pub src: (Ipv6Addr, u16),
    pub dst: (Ipv6Addr, u16),
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub seq: i32,
    pub ack_number: i32,
    pub payload: Vec<u8>,
}

/// Parse an IPv6 TCP frame; returns `None` for anything else.
pub(crate) fn parse_tcp_frame(frame: &[u8]) -> Option<ParsedTcpFrame> {
    let ip = Ipv6Packet::new_checked(frame).ok()?;
    if ip.next_header() != IpProtocol::Tcp {
        return None;
    }
    let tcp = TcpPacket::new_checked(ip.payload()).ok()?;
    Some(ParsedTcpFrame {
        src: (ip.src_addr(), tcp.src_port()),
        dst: (ip.dst_addr(), tcp.dst_port()),
        syn: tcp.syn(),
        ack: tcp.ack(),
        fin: tcp.fin(),
        rst: tcp.rst(),
        seq: tcp.seq_number().0,
        ack_number: tcp.ack_number().0,
        payload: tcp.payload().to_vec(),
    })
}
