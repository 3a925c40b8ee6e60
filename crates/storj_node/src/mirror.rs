//! Concrete [`storj_protocol::farmer::ShardSource`]: pulls a shard from another
//! farmer over a real PULL data channel, for the MIRROR handler (§4.7).

use storj_datachannel::TokenValue;
use storj_protocol::farmer::ShardSource;
use storj_protocol::ProtocolError;
use tokio::net::TcpStream;

pub struct TcpShardSource;

#[async_trait::async_trait]
impl ShardSource for TcpShardSource {
    async fn pull_shard(
        &self,
        contact: &str,
        token: TokenValue,
        hash: [u8; 20],
    ) -> Result<Vec<u8>, ProtocolError> {
        let stream = TcpStream::connect(contact)
            .await
            .map_err(|e| ProtocolError::InvalidParams(format!("could not reach mirror source {contact}: {e}")))?;
        storj_datachannel::pull(stream, token, hash)
            .await
            .map_err(|e| ProtocolError::InvalidParams(format!("mirror pull failed: {e}")))
    }
}
