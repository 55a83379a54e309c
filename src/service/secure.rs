use crate::core::codec::PacketCodec;
use crate::core::packet::Packet;
use crate::error::Result;
use crate::utils::crypto::SessionCipher;

use bytes::Bytes;
use std::sync::Arc;
use tracing::{instrument, trace};

/// Codec plus the cipher that was active for one exchange.
///
/// `seal` is encode then encrypt; `open` is decrypt then decode. Without a
/// cipher both are plain codec calls.
#[derive(Debug, Clone)]
pub struct Envelope {
    codec: Arc<dyn PacketCodec>,
    cipher: Option<Arc<SessionCipher>>,
}

impl Envelope {
    pub fn new(codec: Arc<dyn PacketCodec>, cipher: Option<Arc<SessionCipher>>) -> Self {
        Self { codec, cipher }
    }

    pub fn plaintext(codec: Arc<dyn PacketCodec>) -> Self {
        Self::new(codec, None)
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    #[instrument(skip_all, level = "trace", fields(packet_id = %packet.id))]
    pub fn seal(&self, packet: &Packet) -> Result<Bytes> {
        let encoded = self.codec.encode(packet)?;
        let bytes = match &self.cipher {
            Some(cipher) => cipher.encrypt(&encoded)?,
            None => encoded,
        };
        trace!(len = bytes.len(), encrypted = self.is_encrypted(), "Sealed packet");
        Ok(Bytes::from(bytes))
    }

    pub fn open(&self, payload: &[u8]) -> Result<Packet> {
        match &self.cipher {
            Some(cipher) => {
                let plaintext = cipher.decrypt(payload)?;
                self.codec.decode(&plaintext)
            }
            None => self.codec.decode(payload),
        }
    }
}
