use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::store::Peer;

pub const PERSISTENT_KEEPALIVE: u16 = 25;
const FULL_TUNNEL: &str = "0.0.0.0/0, ::/0";

/**
 * @brief Render the wg-quick style config a client imports.
 * @param peer Peer whose key pair was generated by the gateway.
 * @param cfg Server configuration (public key, endpoint, port, subnet).
 *
 * Exit nodes route everything through the gateway; other peers only the VPN subnet.
 */
pub fn render(peer: &Peer, cfg: &ServerConfig) -> Result<String> {
    let private_key = peer.private_key.as_deref().ok_or_else(|| {
        Error::validation(format!("peer {} brought its own key; no private key to export", peer.name))
    })?;
    let allowed_ips = if peer.use_as_exit_node { FULL_TUNNEL.to_string() } else { cfg.subnet()? };
    Ok(format!(
        "[Interface]\n\
         PrivateKey = {private_key}\n\
         Address = {address}\n\
         \n\
         [Peer]\n\
         PublicKey = {server_key}\n\
         Endpoint = {endpoint}:{port}\n\
         AllowedIPs = {allowed_ips}\n\
         PersistentKeepalive = {PERSISTENT_KEEPALIVE}\n",
        address = peer.assigned_address,
        server_key = cfg.server_public_key_b64()?,
        endpoint = cfg.public_endpoint,
        port = cfg.listen_port,
    ))
}

/// Terminal QR code of a rendered config, for scanning with a phone.
pub fn render_qr(text: &str) -> Result<String> {
    let code = qrcode::QrCode::new(text.as_bytes()).map_err(|e| Error::validation(format!("QR code: {e}")))?;
    Ok(code.render::<char>().quiet_zone(false).module_dimensions(2, 1).build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_key_pair;

    fn fixtures(exit_node: bool) -> (Peer, ServerConfig) {
        let pair = generate_key_pair();
        let peer = Peer {
            id: 1,
            name: "laptop".into(),
            public_key: pair.public_b64,
            private_key: Some(pair.private_b64),
            assigned_address: "10.8.0.2/32".into(),
            enabled: true,
            use_as_exit_node: exit_node,
        };
        let cfg = ServerConfig {
            public_endpoint: "vpn.example.net".into(),
            server_private_key_b64: Some(generate_key_pair().private_b64),
            ..ServerConfig::default()
        };
        (peer, cfg)
    }

    #[test]
    fn template_lines_are_fixed() {
        let (peer, cfg) = fixtures(false);
        let text = render(&peer, &cfg).unwrap();
        let expected = format!(
            "[Interface]\nPrivateKey = {}\nAddress = 10.8.0.2/32\n\n[Peer]\nPublicKey = {}\nEndpoint = vpn.example.net:51820\nAllowedIPs = 10.8.0.0/24\nPersistentKeepalive = 25\n",
            peer.private_key.as_deref().unwrap(),
            cfg.server_public_key_b64().unwrap(),
        );
        assert_eq!(text, expected);
    }

    #[test]
    fn exit_node_routes_everything() {
        let (peer, cfg) = fixtures(true);
        let text = render(&peer, &cfg).unwrap();
        assert!(text.contains("AllowedIPs = 0.0.0.0/0, ::/0\n"));
    }

    #[test]
    fn peer_without_private_key_cannot_export() {
        let (mut peer, cfg) = fixtures(false);
        peer.private_key = None;
        assert!(matches!(render(&peer, &cfg), Err(Error::Validation(_))));
    }
}
