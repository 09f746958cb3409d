//! Header window extraction.
//!
//! Only the link, network and transport headers of a frame are reported;
//! the payload never leaves the host.

use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::Packet;

/// Ethernet II header length.
pub const ETHERNET_HEADER_LEN: usize = 14;
/// Minimum IPv4 header length (IHL = 5).
pub const IPV4_MIN_HEADER_LEN: usize = 20;
/// Fixed TCP header length, options excluded.
pub const TCP_HEADER_LEN: usize = 20;
/// UDP header length.
pub const UDP_HEADER_LEN: usize = 8;

/// Transport protocol carried by a reported frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn header_len(self) -> usize {
        match self {
            Transport::Tcp => TCP_HEADER_LEN,
            Transport::Udp => UDP_HEADER_LEN,
        }
    }
}

/// Classify an Ethernet frame and return the transport and header window length.
///
/// Returns `None` for anything that is not Ethernet/IPv4 carrying TCP or UDP,
/// and for frames too short to contain the full window.
pub fn classify(frame: &[u8]) -> Option<(Transport, usize)> {
    let ethernet = EthernetPacket::new(frame)?;
    if ethernet.get_ethertype() != EtherTypes::Ipv4 {
        return None;
    }

    let ipv4 = Ipv4Packet::new(ethernet.payload())?;
    let ip_header_len = usize::from(ipv4.get_header_length()) * 4;
    if ip_header_len < IPV4_MIN_HEADER_LEN {
        return None;
    }

    let protocol = ipv4.get_next_level_protocol();
    let transport = if protocol == IpNextHeaderProtocols::Tcp {
        Transport::Tcp
    } else if protocol == IpNextHeaderProtocols::Udp {
        Transport::Udp
    } else {
        return None;
    };

    let window = ETHERNET_HEADER_LEN + ip_header_len + transport.header_len();
    if window > frame.len() {
        return None;
    }

    Some((transport, window))
}

/// Length of the header window of `frame`, if it should be reported.
pub fn header_window(frame: &[u8]) -> Option<usize> {
    classify(frame).map(|(_, window)| window)
}
