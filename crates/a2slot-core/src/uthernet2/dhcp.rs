/// Virtual DHCP server.
///
/// Answers the standard DISCOVER/REQUEST handshake with an OFFER and
/// an ACK for a fixed lease: client 192.168.65.100 behind gateway
/// 192.168.65.1. Completing the handshake also writes the negotiated
/// addresses into the W5100 common registers, so software that reads
/// SIPR/GAR/SUBR instead of parsing the ACK still sees them.
use super::frame::{
    ip_checksum, read_u16, write_u16, DHCP_ACK, DHCP_CHADDR, DHCP_DISCOVER, DHCP_MAGIC,
    DHCP_MAGIC_COOKIE, DHCP_OFFER, DHCP_OPTIONS, DHCP_REQUEST, DHCP_XID, ETHERTYPE_IPV4,
    ETH_HEADER_LEN, ETH_TYPE, IPH_CHECKSUM, IPH_HEADER_LEN, IPH_LEN, IPH_PROTO, IPPROTO_UDP,
    UDP_DST_PORT, UDP_HEADER_LEN, UDP_LEN, UDP_SRC_PORT,
};
use super::vnet::{
    VIRTUAL_CLIENT_IP, VIRTUAL_DNS, VIRTUAL_SERVER_IP, VIRTUAL_SERVER_MAC, VIRTUAL_SUBNET,
};
use super::w5100::{GAR, SIPR, SUBR, W5100};

/// Smallest frame that can hold Ethernet + IP + UDP + the fixed
/// 240-byte DHCP header + the magic cookie.
const MIN_DHCP_FRAME: usize = 286;

/// DHCP payloads are padded to the classic BOOTP minimum.
const MIN_DHCP_PAYLOAD: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub(crate) enum DhcpState {
    #[default]
    Idle,
    DiscoverSeen,
    OfferSent,
    RequestSeen,
    Complete,
}

#[derive(Default)]
pub(crate) struct DhcpServer {
    pub state: DhcpState,
    /// Transaction ID of the last request seen.
    pub xid: [u8; 4],
    /// Client hardware address from the last request seen.
    pub client_mac: [u8; 6],
}

/// Identify a client-to-server DHCP message and return its type
/// (option 53), or `None` if the frame is not DHCP.
pub(crate) fn message_type(frame: &[u8]) -> Option<u8> {
    if frame.len() < MIN_DHCP_FRAME {
        return None;
    }
    if read_u16(frame, ETH_TYPE) != ETHERTYPE_IPV4 {
        return None;
    }
    let ip = &frame[ETH_HEADER_LEN..];
    if ip[IPH_PROTO] != IPPROTO_UDP {
        return None;
    }
    let udp = &ip[IPH_HEADER_LEN..];
    if read_u16(udp, UDP_SRC_PORT) != 68 || read_u16(udp, UDP_DST_PORT) != 67 {
        return None;
    }
    let dhcp = &udp[UDP_HEADER_LEN..];
    if dhcp[DHCP_MAGIC..DHCP_MAGIC + 4] != DHCP_MAGIC_COOKIE {
        return None;
    }

    let mut i = DHCP_OPTIONS;
    while i < dhcp.len() && dhcp[i] != 255 {
        if dhcp[i] == 0 {
            i += 1;
            continue;
        }
        if dhcp[i] == 53 && i + 2 < dhcp.len() {
            return Some(dhcp[i + 2]);
        }
        if i + 1 >= dhcp.len() {
            break;
        }
        i += 2 + dhcp[i + 1] as usize;
    }
    None
}

impl W5100 {
    pub(crate) fn handle_dhcp(&mut self, n: usize, message_type: u8, frame: &[u8]) {
        log::debug!("Uthernet II: detected DHCP type {}", message_type);

        let dhcp = &frame[ETH_HEADER_LEN + IPH_HEADER_LEN + UDP_HEADER_LEN..];
        self.dhcp.xid.copy_from_slice(&dhcp[DHCP_XID..DHCP_XID + 4]);
        self.dhcp
            .client_mac
            .copy_from_slice(&dhcp[DHCP_CHADDR..DHCP_CHADDR + 6]);

        match message_type {
            DHCP_DISCOVER => {
                log::debug!("Uthernet II: DHCP DISCOVER, sending OFFER");
                self.dhcp.state = DhcpState::DiscoverSeen;
                let reply = build_reply(&self.dhcp, false);
                if self.sockets[n].inject_frame(&reply) {
                    log::debug!("Uthernet II: injected DHCP OFFER ({} bytes)", reply.len() + 2);
                }
                self.dhcp.state = DhcpState::OfferSent;
            }
            DHCP_REQUEST => {
                log::debug!("Uthernet II: DHCP REQUEST, sending ACK");
                self.dhcp.state = DhcpState::RequestSeen;
                let reply = build_reply(&self.dhcp, true);
                if self.sockets[n].inject_frame(&reply) {
                    log::debug!("Uthernet II: injected DHCP ACK ({} bytes)", reply.len() + 2);
                }
                self.dhcp.state = DhcpState::Complete;

                // Commit the negotiated addresses to the common
                // registers.
                self.mem[SIPR as usize..SIPR as usize + 4].copy_from_slice(&VIRTUAL_CLIENT_IP);
                self.mem[GAR as usize..GAR as usize + 4].copy_from_slice(&VIRTUAL_SERVER_IP);
                self.mem[SUBR as usize..SUBR as usize + 4].copy_from_slice(&VIRTUAL_SUBNET);
            }
            _ => {}
        }
    }
}

/// Build a BOOTREPLY carrying an OFFER or an ACK. The OFFER goes to
/// the IP broadcast address (the client has no address yet); the ACK
/// goes to the leased client address.
fn build_reply(server: &DhcpServer, is_ack: bool) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(ETH_HEADER_LEN + IPH_HEADER_LEN + UDP_HEADER_LEN + 312);

    // Ethernet: broadcast either way; the client may not have
    // configured its address filter yet.
    pkt.extend_from_slice(&[0xFF; 6]);
    pkt.extend_from_slice(&VIRTUAL_SERVER_MAC);
    pkt.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

    let ip_start = pkt.len();
    pkt.extend_from_slice(&[0x45, 0x00, 0x00, 0x00]); // version/IHL, TOS, length
    pkt.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]); // ID, flags/fragment
    pkt.push(64); // TTL
    pkt.push(IPPROTO_UDP);
    pkt.extend_from_slice(&[0x00, 0x00]); // checksum, filled below
    pkt.extend_from_slice(&VIRTUAL_SERVER_IP);
    if is_ack {
        pkt.extend_from_slice(&VIRTUAL_CLIENT_IP);
    } else {
        pkt.extend_from_slice(&[255, 255, 255, 255]);
    }

    let udp_start = pkt.len();
    pkt.extend_from_slice(&67u16.to_be_bytes());
    pkt.extend_from_slice(&68u16.to_be_bytes());
    pkt.extend_from_slice(&[0x00, 0x00]); // length, filled below
    pkt.extend_from_slice(&[0x00, 0x00]); // checksum optional, zero

    let dhcp_start = pkt.len();
    pkt.extend_from_slice(&[2, 1, 6, 0]); // BOOTREPLY, Ethernet, hlen 6, hops 0
    pkt.extend_from_slice(&server.xid);
    pkt.extend_from_slice(&[0, 0, 0, 0]); // secs, flags
    pkt.extend_from_slice(&[0, 0, 0, 0]); // ciaddr
    pkt.extend_from_slice(&VIRTUAL_CLIENT_IP); // yiaddr
    pkt.extend_from_slice(&VIRTUAL_SERVER_IP); // siaddr
    pkt.extend_from_slice(&[0, 0, 0, 0]); // giaddr
    pkt.extend_from_slice(&server.client_mac);
    pkt.extend_from_slice(&[0u8; 10]); // chaddr padding
    pkt.extend_from_slice(&[0u8; 64]); // sname
    pkt.extend_from_slice(&[0u8; 128]); // file
    pkt.extend_from_slice(&DHCP_MAGIC_COOKIE);

    // Options: message type, server id, lease time (1 day), subnet
    // mask, router, DNS, end.
    pkt.extend_from_slice(&[53, 1, if is_ack { DHCP_ACK } else { DHCP_OFFER }]);
    pkt.extend_from_slice(&[54, 4]);
    pkt.extend_from_slice(&VIRTUAL_SERVER_IP);
    pkt.extend_from_slice(&[51, 4, 0x00, 0x01, 0x51, 0x80]);
    pkt.extend_from_slice(&[1, 4]);
    pkt.extend_from_slice(&VIRTUAL_SUBNET);
    pkt.extend_from_slice(&[3, 4]);
    pkt.extend_from_slice(&VIRTUAL_SERVER_IP);
    pkt.extend_from_slice(&[6, 4]);
    pkt.extend_from_slice(&VIRTUAL_DNS);
    pkt.push(255);

    while pkt.len() - dhcp_start < MIN_DHCP_PAYLOAD {
        pkt.push(0);
    }

    let udp_len = (pkt.len() - udp_start) as u16;
    write_u16(&mut pkt, udp_start + UDP_LEN, udp_len);

    let ip_len = (pkt.len() - ip_start) as u16;
    write_u16(&mut pkt, ip_start + IPH_LEN, ip_len);

    let checksum = ip_checksum(&pkt[ip_start..ip_start + IPH_HEADER_LEN]);
    write_u16(&mut pkt, ip_start + IPH_CHECKSUM, checksum);

    pkt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uthernet2::frame::{DHCP_SIADDR, DHCP_YIADDR, IPH_DST, IPH_SRC};

    /// Minimal valid client frame for the given message type.
    fn client_frame(message_type: u8, xid: [u8; 4], mac: [u8; 6]) -> Vec<u8> {
        let mut f = Vec::new();
        f.extend_from_slice(&[0xFF; 6]);
        f.extend_from_slice(&mac);
        f.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

        let ip_start = f.len();
        f.extend_from_slice(&[0x45, 0, 0, 0, 0, 0, 0, 0, 64, IPPROTO_UDP, 0, 0]);
        f.extend_from_slice(&[0, 0, 0, 0]); // src 0.0.0.0
        f.extend_from_slice(&[255, 255, 255, 255]);

        let udp_start = f.len();
        f.extend_from_slice(&68u16.to_be_bytes());
        f.extend_from_slice(&67u16.to_be_bytes());
        f.extend_from_slice(&[0, 0, 0, 0]);

        let dhcp_start = f.len();
        f.extend_from_slice(&[1, 1, 6, 0]); // BOOTREQUEST
        f.extend_from_slice(&xid);
        f.extend_from_slice(&[0u8; 20]); // secs..giaddr
        f.extend_from_slice(&mac);
        f.extend_from_slice(&[0u8; 10]);
        f.extend_from_slice(&[0u8; 64]);
        f.extend_from_slice(&[0u8; 128]);
        f.extend_from_slice(&DHCP_MAGIC_COOKIE);
        f.extend_from_slice(&[53, 1, message_type, 255]);
        while f.len() - dhcp_start < 300 {
            f.push(0);
        }

        let udp_len = (f.len() - udp_start) as u16;
        write_u16(&mut f, udp_start + UDP_LEN, udp_len);
        let ip_len = (f.len() - ip_start) as u16;
        write_u16(&mut f, ip_start + IPH_LEN, ip_len);
        f
    }

    /// Walk a staged frame's DHCP options for `opt`.
    fn find_option(dhcp: &[u8], opt: u8) -> Option<&[u8]> {
        let mut i = DHCP_OPTIONS;
        while i < dhcp.len() && dhcp[i] != 255 {
            if dhcp[i] == 0 {
                i += 1;
                continue;
            }
            let len = dhcp[i + 1] as usize;
            if dhcp[i] == opt {
                return Some(&dhcp[i + 2..i + 2 + len]);
            }
            i += 2 + len;
        }
        None
    }

    #[test]
    fn detects_message_types() {
        let f = client_frame(DHCP_DISCOVER, [0xDE, 0xAD, 0xBE, 0xEF], [8, 0, 7, 1, 2, 3]);
        assert_eq!(message_type(&f), Some(DHCP_DISCOVER));

        let f = client_frame(DHCP_REQUEST, [1, 2, 3, 4], [8, 0, 7, 1, 2, 3]);
        assert_eq!(message_type(&f), Some(DHCP_REQUEST));

        // Wrong ports are not DHCP.
        let mut f = client_frame(DHCP_DISCOVER, [1, 2, 3, 4], [8, 0, 7, 1, 2, 3]);
        write_u16(&mut f, ETH_HEADER_LEN + IPH_HEADER_LEN + UDP_SRC_PORT, 1068);
        assert_eq!(message_type(&f), None);

        // Truncated frames are not DHCP.
        assert_eq!(message_type(&f[..200]), None);
    }

    #[test]
    fn discover_yields_offer_with_lease_details() {
        let mut w = W5100::new();
        let xid = [0xDE, 0xAD, 0xBE, 0xEF];
        let mac = [0x08, 0x00, 0x07, 0x12, 0x34, 0x56];
        let f = client_frame(DHCP_DISCOVER, xid, mac);
        w.handle_dhcp(0, DHCP_DISCOVER, &f);

        assert_eq!(w.dhcp.state, DhcpState::OfferSent);
        assert_eq!(w.dhcp.xid, xid);
        assert_eq!(w.dhcp.client_mac, mac);

        let total = w.sockets[0].rx_tail as usize;
        assert!(total >= 300, "staged OFFER is {} bytes", total);
        // Prefix counts itself.
        let prefix = ((w.sockets[0].staging[0] as usize) << 8) | w.sockets[0].staging[1] as usize;
        assert_eq!(prefix, total);

        let reply = &w.sockets[0].staging[2..total];
        assert_eq!(&reply[0..6], &[0xFF; 6]);
        assert_eq!(&reply[6..12], &VIRTUAL_SERVER_MAC);

        let ip = &reply[ETH_HEADER_LEN..];
        assert_eq!(&ip[IPH_SRC..IPH_SRC + 4], &VIRTUAL_SERVER_IP);
        assert_eq!(&ip[IPH_DST..IPH_DST + 4], &[255, 255, 255, 255]);
        // A valid IP checksum folds to all ones.
        assert_eq!(
            !ip_checksum(&ip[..IPH_HEADER_LEN]),
            0xFFFF,
            "IP header checksum"
        );

        let dhcp = &ip[IPH_HEADER_LEN + UDP_HEADER_LEN..];
        assert_eq!(dhcp[0], 2); // BOOTREPLY
        assert_eq!(&dhcp[DHCP_XID..DHCP_XID + 4], &xid);
        assert_eq!(&dhcp[DHCP_YIADDR..DHCP_YIADDR + 4], &VIRTUAL_CLIENT_IP);
        assert_eq!(&dhcp[DHCP_SIADDR..DHCP_SIADDR + 4], &VIRTUAL_SERVER_IP);
        assert!(dhcp.len() >= 300);

        assert_eq!(find_option(dhcp, 53), Some(&[DHCP_OFFER][..]));
        assert_eq!(find_option(dhcp, 54), Some(&VIRTUAL_SERVER_IP[..]));
        assert_eq!(find_option(dhcp, 51), Some(&[0x00, 0x01, 0x51, 0x80][..]));
        assert_eq!(find_option(dhcp, 1), Some(&VIRTUAL_SUBNET[..]));
        assert_eq!(find_option(dhcp, 3), Some(&VIRTUAL_SERVER_IP[..]));
        assert_eq!(find_option(dhcp, 6), Some(&VIRTUAL_DNS[..]));
    }

    #[test]
    fn request_yields_ack_and_commits_registers() {
        let mut w = W5100::new();
        let xid = [0x12, 0x34, 0x56, 0x78];
        let mac = [0x08, 0x00, 0x07, 0x12, 0x34, 0x56];

        let f = client_frame(DHCP_DISCOVER, xid, mac);
        w.handle_dhcp(0, DHCP_DISCOVER, &f);
        let offer_end = w.sockets[0].rx_tail as usize;

        let f = client_frame(DHCP_REQUEST, xid, mac);
        w.handle_dhcp(0, DHCP_REQUEST, &f);
        assert_eq!(w.dhcp.state, DhcpState::Complete);

        // The ACK appended after the OFFER rather than replacing it.
        assert!(w.sockets[0].rx_tail as usize > offer_end);

        let ack = &w.sockets[0].staging[offer_end + 2..w.sockets[0].rx_tail as usize];
        let ip = &ack[ETH_HEADER_LEN..];
        assert_eq!(&ip[IPH_DST..IPH_DST + 4], &VIRTUAL_CLIENT_IP);
        let dhcp = &ip[IPH_HEADER_LEN + UDP_HEADER_LEN..];
        assert_eq!(find_option(dhcp, 53), Some(&[DHCP_ACK][..]));

        assert_eq!(&w.mem[SIPR as usize..SIPR as usize + 4], &VIRTUAL_CLIENT_IP);
        assert_eq!(&w.mem[GAR as usize..GAR as usize + 4], &VIRTUAL_SERVER_IP);
        assert_eq!(&w.mem[SUBR as usize..SUBR as usize + 4], &VIRTUAL_SUBNET);
    }

    #[test]
    fn state_machine_walks_the_documented_sequence() {
        let mut w = W5100::new();
        assert_eq!(w.dhcp.state, DhcpState::Idle);
        let mac = [8, 0, 7, 1, 2, 3];
        w.handle_dhcp(0, DHCP_DISCOVER, &client_frame(DHCP_DISCOVER, [1, 1, 1, 1], mac));
        assert_eq!(w.dhcp.state, DhcpState::OfferSent);
        w.handle_dhcp(0, DHCP_REQUEST, &client_frame(DHCP_REQUEST, [1, 1, 1, 1], mac));
        assert_eq!(w.dhcp.state, DhcpState::Complete);
    }
}
