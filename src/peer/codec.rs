use std::io;

use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use libp2p::StreamProtocol;
use libp2p::request_response::Codec;

use super::types::{RetrievalTransports, StorageProposalParams, StorageProposalResponse};

/// Hard cap on a single RPC frame; well above any observed response.
const MAX_MESSAGE_BYTES: usize = 8 << 20;

/// CBOR messages on these sub-protocols are unframed: a single encoded value
/// per direction. Responders do not always half-close after writing, so the
/// reader decodes incrementally instead of waiting for EOF.
async fn read_cbor<T, M>(io: &mut T) -> io::Result<M>
where
    T: AsyncRead + Unpin + Send,
    M: serde::de::DeserializeOwned,
{
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    loop {
        let n = io.read(&mut chunk).await?;
        if n == 0 {
            return serde_ipld_dagcbor::from_slice(&buf)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e));
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_MESSAGE_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "cbor rpc message too large",
            ));
        }
        if let Ok(decoded) = serde_ipld_dagcbor::from_slice(&buf) {
            return Ok(decoded);
        }
    }
}

async fn write_cbor<T, M>(io: &mut T, msg: &M) -> io::Result<()>
where
    T: AsyncWrite + Unpin + Send,
    M: serde::Serialize,
{
    let bytes = serde_ipld_dagcbor::to_vec(msg)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    io.write_all(&bytes).await?;
    io.flush().await
}

/// `/fil/storage/mk/1.2.0`: params out, accept/reject verdict back.
#[derive(Clone, Default)]
pub struct ProposalCodec;

#[async_trait::async_trait]
impl Codec for ProposalCodec {
    type Protocol = StreamProtocol;
    type Request = StorageProposalParams;
    type Response = StorageProposalResponse;

    async fn read_request<T>(&mut self, _: &Self::Protocol, _io: &mut T) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        // the broker only ever dials out
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "inbound storage proposals are not served",
        ))
    }

    async fn read_response<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
    ) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_cbor(io).await
    }

    async fn write_request<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        req: Self::Request,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_cbor(io, &req).await
    }

    async fn write_response<T>(
        &mut self,
        _: &Self::Protocol,
        _io: &mut T,
        _res: Self::Response,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "inbound storage proposals are not served",
        ))
    }
}

/// `/fil/retrieval/transports/1.0.0`: the query carries no payload at all,
/// the stream open itself is the request.
#[derive(Clone, Default)]
pub struct TransportsCodec;

#[async_trait::async_trait]
impl Codec for TransportsCodec {
    type Protocol = StreamProtocol;
    type Request = ();
    type Response = RetrievalTransports;

    async fn read_request<T>(&mut self, _: &Self::Protocol, _io: &mut T) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "inbound transport queries are not served",
        ))
    }

    async fn read_response<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
    ) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_cbor(io).await
    }

    async fn write_request<T>(
        &mut self,
        _: &Self::Protocol,
        _io: &mut T,
        _req: Self::Request,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        Ok(())
    }

    async fn write_response<T>(
        &mut self,
        _: &Self::Protocol,
        _io: &mut T,
        _res: Self::Response,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "inbound transport queries are not served",
        ))
    }
}
