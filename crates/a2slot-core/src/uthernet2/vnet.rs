/// Virtual network behind the MACRAW socket.
///
/// Frames the Apple II sends while socket 0 is in MACRAW mode never
/// reach a real wire. The card itself answers as the gateway: ARP
/// probes for 192.168.65.1, DHCP configuration, and TCP flows that
/// terminate on host loopback sockets. Replies are staged straight
/// into the socket's RX buffer.
use super::dhcp;
use super::frame::{
    read_u16, ETHERTYPE_ARP, ETHERTYPE_IPV4, ETH_HEADER_LEN, ETH_TYPE, IPH_DST, IPH_HEADER_LEN,
    IPH_PROTO, IPPROTO_TCP,
};
use super::socket::SOCK_BUF_MASK;
use super::w5100::{socket_base, tx_base, SN_TX_RD, SN_TX_WR, W5100};

pub(crate) const VIRTUAL_SERVER_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
pub(crate) const VIRTUAL_GATEWAY_MAC: [u8; 6] = [0x02, 0x00, 0xDE, 0xAD, 0xBE, 0x01];
pub(crate) const VIRTUAL_CLIENT_IP: [u8; 4] = [192, 168, 65, 100];
pub(crate) const VIRTUAL_SERVER_IP: [u8; 4] = [192, 168, 65, 1];
pub(crate) const VIRTUAL_SUBNET: [u8; 4] = [255, 255, 255, 0];
pub(crate) const VIRTUAL_DNS: [u8; 4] = [8, 8, 8, 8];

/// Largest frame a MACRAW SEND may carry.
const MAX_FRAME_LEN: usize = 1600;

impl W5100 {
    /// Drain the TX ring on a MACRAW SEND and route the frame to the
    /// virtual responders. Unrecognized traffic is dropped without a
    /// reply.
    pub(crate) fn macraw_send(&mut self, n: usize) {
        let base = socket_base(n);
        let tx_rd = self.mem16(base + SN_TX_RD);
        let tx_wr = self.mem16(base + SN_TX_WR);
        let len = (tx_wr.wrapping_sub(tx_rd) & SOCK_BUF_MASK) as usize;
        if len == 0 || len > MAX_FRAME_LEN {
            log::debug!("Uthernet II: MACRAW invalid frame length {}", len);
            return;
        }

        let tb = tx_base(n);
        let mut frame = vec![0u8; len];
        for (i, byte) in frame.iter_mut().enumerate() {
            let offset = tx_rd.wrapping_sub(tb).wrapping_add(i as u16) & SOCK_BUF_MASK;
            *byte = self.mem[(tb + offset) as usize];
        }
        self.set_mem16(base + SN_TX_RD, tx_wr);

        log::debug!("Uthernet II: MACRAW send {} bytes", len);

        if let Some(message_type) = dhcp::message_type(&frame) {
            self.handle_dhcp(n, message_type, &frame);
            return;
        }

        if frame.len() < ETH_HEADER_LEN {
            return;
        }
        match read_u16(&frame, ETH_TYPE) {
            ETHERTYPE_ARP => self.handle_arp(n, &frame),
            ETHERTYPE_IPV4 if frame.len() >= ETH_HEADER_LEN + IPH_HEADER_LEN => {
                let ip = &frame[ETH_HEADER_LEN..];
                // Terminate TCP only for the synthetic gateway
                // subnets; everything else has nowhere to go.
                if ip[IPH_PROTO] == IPPROTO_TCP
                    && ip[IPH_DST] == 192
                    && ip[IPH_DST + 1] == 168
                    && (ip[IPH_DST + 2] == 64 || ip[IPH_DST + 2] == 65)
                {
                    self.handle_tcp(n, &frame);
                }
            }
            _ => {}
        }
    }
}
