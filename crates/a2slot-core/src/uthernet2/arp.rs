/// Virtual ARP responder.
///
/// Only requests for the virtual gateway (192.168.65.1) are
/// answered; every other ARP frame is dropped.
use super::frame::{
    read_u16, ARP_OPER, ARP_PAYLOAD_LEN, ARP_SHA, ARP_SPA, ARP_TPA, ETHERTYPE_ARP, ETH_HEADER_LEN,
};
use super::vnet::{VIRTUAL_GATEWAY_MAC, VIRTUAL_SERVER_IP};
use super::w5100::W5100;

impl W5100 {
    pub(crate) fn handle_arp(&mut self, n: usize, frame: &[u8]) {
        if frame.len() < ETH_HEADER_LEN + ARP_PAYLOAD_LEN {
            return;
        }
        let arp = &frame[ETH_HEADER_LEN..];

        if read_u16(arp, ARP_OPER) != 1 {
            return;
        }
        if arp[ARP_TPA..ARP_TPA + 4] != VIRTUAL_SERVER_IP {
            log::debug!(
                "Uthernet II: ARP for {}.{}.{}.{} (not gateway)",
                arp[ARP_TPA],
                arp[ARP_TPA + 1],
                arp[ARP_TPA + 2],
                arp[ARP_TPA + 3]
            );
            return;
        }

        log::debug!("Uthernet II: ARP request for gateway, sending reply");

        let mut pkt = Vec::with_capacity(ETH_HEADER_LEN + ARP_PAYLOAD_LEN);
        // Ethernet: back to the requester, from the gateway.
        pkt.extend_from_slice(&arp[ARP_SHA..ARP_SHA + 6]);
        pkt.extend_from_slice(&VIRTUAL_GATEWAY_MAC);
        pkt.extend_from_slice(&ETHERTYPE_ARP.to_be_bytes());
        // ARP reply: Ethernet/IPv4, operation 2.
        pkt.extend_from_slice(&[0x00, 0x01, 0x08, 0x00, 6, 4, 0x00, 0x02]);
        pkt.extend_from_slice(&VIRTUAL_GATEWAY_MAC);
        pkt.extend_from_slice(&VIRTUAL_SERVER_IP);
        pkt.extend_from_slice(&arp[ARP_SHA..ARP_SHA + 6]);
        pkt.extend_from_slice(&arp[ARP_SPA..ARP_SPA + 4]);

        if self.sockets[n].inject_frame(&pkt) {
            log::debug!("Uthernet II: injected ARP reply ({} bytes)", pkt.len() + 2);
        }
    }
}
