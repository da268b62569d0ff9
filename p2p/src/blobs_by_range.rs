use core::{fmt::Display, hash::Hash};
use std::{io::ErrorKind, sync::Arc};

use futures::{SinkExt as _, StreamExt as _, TryStreamExt as _};
use log::{debug, warn};
use prometheus_metrics::Metrics;
use sidecar_store::SidecarStore;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt as _},
    time::{self, Instant},
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};
use types::{
    config::Config,
    containers::{BlobSidecar, BlobSidecarsByRangeRequest},
    primitives::Slot,
    traits::BeaconBlock as _,
};

use crate::{
    codec::{RequestCodec, ResponseChunk, ResponseCodec},
    error::{Error, InvalidFetchedData, ProtocolError},
    misc::{ResponseCode, SIDECAR_REQUEST_COST},
    rate_limiter::RateLimiter,
    traits::{BlobSidecarVerifier, BlockLookup},
};

type ResponseWriter<'stream, S> = FramedWrite<&'stream mut S, ResponseCodec>;

/// Serves `BlobSidecarsByRange` requests from the sidecar store.
pub struct BlobSidecarsByRangeServer<K> {
    config: Arc<Config>,
    store: Arc<SidecarStore>,
    rate_limiter: Arc<RateLimiter<K>>,
    metrics: Option<Arc<Metrics>>,
}

impl<K: Eq + Hash + Clone + Display + Send + Sync> BlobSidecarsByRangeServer<K> {
    #[must_use]
    pub const fn new(
        config: Arc<Config>,
        store: Arc<SidecarStore>,
        rate_limiter: Arc<RateLimiter<K>>,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        Self {
            config,
            store,
            rate_limiter,
            metrics,
        }
    }

    /// Reads a request from `stream` and responds to it.
    ///
    /// A request that cannot be decoded is answered with an `InvalidRequest` chunk.
    pub async fn handle_stream<S>(
        &self,
        peer: &K,
        mut stream: S,
        current_slot: Slot,
        cancel: &CancellationToken,
    ) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let deadline = Instant::now() + self.config.response_timeout;

        let request = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            result = time::timeout_at(deadline, self.read_request(&mut stream)) => {
                result.unwrap_or_else(|_| Err(timed_out()))
            }
        };

        match request {
            Ok(request) => {
                self.handle_until(peer, request, current_slot, stream, cancel, deadline)
                    .await
            }
            Err(error) => {
                debug!("unable to read BlobSidecarsByRange request (peer: {peer}): {error}");

                if let Error::Protocol(_) = error {
                    let mut responses = FramedWrite::new(&mut stream, self.response_codec());
                    let chunk =
                        ResponseChunk::error(ResponseCode::InvalidRequest, "malformed request");

                    if let Err(error) = self.send(&mut responses, chunk).await {
                        debug!("unable to send error response (peer: {peer}): {error}");
                    }
                }

                self.close(peer, &mut stream).await;

                Err(error)
            }
        }
    }

    /// Responds to an already decoded request.
    pub async fn handle<S>(
        &self,
        peer: &K,
        request: BlobSidecarsByRangeRequest,
        current_slot: Slot,
        stream: S,
        cancel: &CancellationToken,
    ) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let deadline = Instant::now() + self.config.response_timeout;
        self.handle_until(peer, request, current_slot, stream, cancel, deadline)
            .await
    }

    async fn handle_until<S>(
        &self,
        peer: &K,
        request: BlobSidecarsByRangeRequest,
        current_slot: Slot,
        mut stream: S,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let timer = self
            .metrics
            .as_ref()
            .map(|metrics| metrics.range_request_times.start_timer());

        let result = {
            let mut responses = FramedWrite::new(&mut stream, self.response_codec());

            tokio::select! {
                biased;
                () = cancel.cancelled() => Err(Error::Cancelled),
                result = time::timeout_at(
                    deadline,
                    self.respond(peer, request, current_slot, &mut responses),
                ) => result.unwrap_or_else(|_| Err(timed_out())),
            }
        };

        if let Err(error) = &result {
            warn!("BlobSidecarsByRange response stream aborted (peer: {peer}): {error}");
        }

        self.close(peer, &mut stream).await;

        if let Err(Error::Cancelled) = result {
            prometheus_metrics::stop_and_discard(timer);
        } else {
            prometheus_metrics::stop_and_record(timer);
        }

        result
    }

    async fn respond<S: AsyncWrite + Unpin>(
        &self,
        peer: &K,
        request: BlobSidecarsByRangeRequest,
        current_slot: Slot,
        responses: &mut ResponseWriter<'_, S>,
    ) -> Result<(), Error> {
        debug!("received BlobSidecarsByRange request (peer: {peer}, request: {request:?})");

        if let Some(metrics) = self.metrics.as_ref() {
            metrics.range_requests.inc();
        }

        let BlobSidecarsByRangeRequest { start_slot, count } = request;

        if count == 0 || request.end_slot().is_none() {
            return self
                .send_error(peer, responses, ResponseCode::InvalidRequest, "invalid range")
                .await;
        }

        let earliest_available_slot =
            current_slot.saturating_sub(self.store.retention_window().get());

        if start_slot < earliest_available_slot {
            debug!(
                "received invalid request requesting blobs before availability period \
                 (peer: {peer}, request: {request:?}, earliest_available_slot: \
                 {earliest_available_slot})",
            );

            return self
                .send_error(
                    peer,
                    responses,
                    ResponseCode::InvalidRequest,
                    "requested blobs before data availability period",
                )
                .await;
        }

        // Cannot overflow because `count` did not.
        let end_slot = start_slot + count.min(self.config.max_request_blocks);
        let maximum = self.config.max_request_blob_sidecars;
        let mut sent = 0;

        for slot in start_slot..end_slot {
            if sent >= maximum {
                break;
            }

            if let Err(error) = self.rate_limiter.check(peer, SIDECAR_REQUEST_COST) {
                debug!("rate limiting BlobSidecarsByRange request (peer: {peer}): {error}");

                if let Some(metrics) = self.metrics.as_ref() {
                    metrics.range_requests_rate_limited.inc();
                }

                self.send_error(peer, responses, ResponseCode::ResourceUnavailable, "rate limited")
                    .await?;

                return Err(Error::RateLimited);
            }

            let blob_sidecars = match self.store.get_by_slot(slot) {
                Ok(blob_sidecars) => blob_sidecars,
                Err(error) => {
                    warn!("unable to read blob sidecars at slot {slot}: {error:?}");

                    if let Err(error) = self
                        .send_error(peer, responses, ResponseCode::ServerError, "internal error")
                        .await
                    {
                        debug!("unable to send error response (peer: {peer}): {error}");
                    }

                    return Err(Error::Storage(error));
                }
            };

            if blob_sidecars.is_empty() {
                continue;
            }

            for blob_sidecar in blob_sidecars {
                if sent >= maximum {
                    break;
                }

                debug!(
                    "sending BlobSidecarsByRange response chunk \
                     (peer: {peer}, slot: {slot}, block_root: {:?})",
                    blob_sidecar.block_root,
                );

                let chunk = ResponseChunk::Success(blob_sidecar);

                if let Err(error) = self.send(responses, chunk).await {
                    // The stream may be broken already, so the error chunk is only a courtesy.
                    if let Err(error) = self
                        .send_error(peer, responses, ResponseCode::ServerError, "internal error")
                        .await
                    {
                        debug!("unable to send error response (peer: {peer}): {error}");
                    }

                    return Err(error);
                }

                sent += 1;

                if let Some(metrics) = self.metrics.as_ref() {
                    metrics.range_response_chunks.inc();
                }
            }

            self.rate_limiter.charge(peer, SIDECAR_REQUEST_COST);

            if sent < maximum && slot + 1 < end_slot {
                time::sleep(self.config.response_pacing_interval).await;
            }
        }

        debug!("terminating BlobSidecarsByRange response stream (peer: {peer}, sent: {sent})");

        Ok(())
    }

    async fn read_request<S: AsyncRead + Unpin>(
        &self,
        stream: &mut S,
    ) -> Result<BlobSidecarsByRangeRequest, Error> {
        FramedRead::new(stream, RequestCodec::new(self.config.max_chunk_size))
            .next()
            .await
            .unwrap_or_else(|| Err(ProtocolError::MissingRequest.into()))
    }

    async fn send<S: AsyncWrite + Unpin>(
        &self,
        responses: &mut ResponseWriter<'_, S>,
        chunk: ResponseChunk,
    ) -> Result<(), Error> {
        time::timeout(self.config.write_timeout, responses.send(chunk))
            .await
            .unwrap_or_else(|_| Err(timed_out()))
    }

    async fn send_error<S: AsyncWrite + Unpin>(
        &self,
        peer: &K,
        responses: &mut ResponseWriter<'_, S>,
        code: ResponseCode,
        message: &str,
    ) -> Result<(), Error> {
        debug!(
            "sending BlobSidecarsByRange error response (peer: {peer}, code: {code}): {message}",
        );

        if let Some(metrics) = self.metrics.as_ref() {
            metrics.register_range_error_response(code.as_ref());
        }

        self.send(responses, ResponseChunk::error(code, message))
            .await
    }

    async fn close<S: AsyncWrite + Unpin>(&self, peer: &K, stream: &mut S) {
        match time::timeout(self.config.write_timeout, stream.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => debug!("unable to close stream (peer: {peer}): {error}"),
            Err(_) => debug!("timed out closing stream (peer: {peer})"),
        }
    }

    fn response_codec(&self) -> ResponseCodec {
        ResponseCodec::new(self.config.max_chunk_size)
    }
}

/// Sends `BlobSidecarsByRange` requests and verifies the responses.
pub struct BlobSidecarsByRangeClient<L, V> {
    config: Arc<Config>,
    lookup: L,
    verifier: V,
    metrics: Option<Arc<Metrics>>,
}

impl<L: BlockLookup, V: BlobSidecarVerifier> BlobSidecarsByRangeClient<L, V> {
    #[must_use]
    pub const fn new(
        config: Arc<Config>,
        lookup: L,
        verifier: V,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        Self {
            config,
            lookup,
            verifier,
            metrics,
        }
    }

    /// Sends `request` over `stream` and collects the verified response.
    ///
    /// The response is all or nothing. A single sidecar that fails verification discards the
    /// ones received before it.
    pub async fn request_blob_sidecars_by_range<S>(
        &self,
        mut stream: S,
        request: BlobSidecarsByRangeRequest,
    ) -> Result<Vec<Arc<BlobSidecar>>, Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        time::timeout(self.config.response_timeout, self.exchange(&mut stream, request))
            .await
            .unwrap_or_else(|_| Err(timed_out()))
    }

    async fn exchange<S>(
        &self,
        stream: &mut S,
        request: BlobSidecarsByRangeRequest,
    ) -> Result<Vec<Arc<BlobSidecar>>, Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        debug!("sending BlobSidecarsByRange request (request: {request:?})");

        FramedWrite::new(&mut *stream, RequestCodec::new(self.config.max_chunk_size))
            .send(request)
            .await?;

        stream.shutdown().await?;

        let BlobSidecarsByRangeRequest { start_slot, .. } = request;
        let end_slot = request.end_slot().unwrap_or(Slot::MAX);
        let mut responses = FramedRead::new(stream, ResponseCodec::new(self.config.max_chunk_size));
        let mut blob_sidecars = Vec::<Arc<BlobSidecar>>::new();

        while let Some(chunk) = responses.try_next().await? {
            let blob_sidecar = match chunk {
                ResponseChunk::Success(blob_sidecar) => blob_sidecar,
                ResponseChunk::Error { code, message } => {
                    return Err(Error::ErrorResponse {
                        code,
                        message: String::from_utf8_lossy(message.as_bytes()).into_owned(),
                    });
                }
            };

            let slot = blob_sidecar.slot;
            let block_root = blob_sidecar.block_root;

            if !(start_slot..end_slot).contains(&slot) {
                return Err(InvalidFetchedData::SlotOutOfRange {
                    slot,
                    start_slot,
                    end_slot,
                }
                .into());
            }

            if let Some(previous) = blob_sidecars.last() {
                if previous.slot > slot {
                    return Err(InvalidFetchedData::SlotsNotAscending {
                        previous_slot: previous.slot,
                        slot,
                    }
                    .into());
                }
            }

            let block = self
                .lookup
                .block_by_root(block_root)
                .map_err(Error::Storage)?
                .ok_or(Error::UnknownBlock { block_root })?;

            if let Err(source) = self.verifier.verify(
                block.slot(),
                block_root,
                block.blob_kzg_commitments(),
                &blob_sidecar,
            ) {
                if let Some(metrics) = self.metrics.as_ref() {
                    metrics.sidecar_verification_failures.inc();
                }

                return Err(InvalidFetchedData::VerificationFailed {
                    slot,
                    block_root,
                    source,
                }
                .into());
            }

            debug!(
                "received BlobSidecarsByRange response chunk \
                 (slot: {slot}, block_root: {block_root:?})",
            );

            blob_sidecars.push(blob_sidecar);

            let maximum = self.config.max_request_blob_sidecars;

            if u64::try_from(blob_sidecars.len()).unwrap_or(u64::MAX) > maximum {
                return Err(InvalidFetchedData::TooManySidecars { maximum }.into());
            }
        }

        Ok(blob_sidecars)
    }
}

fn timed_out() -> Error {
    Error::Transport(ErrorKind::TimedOut.into())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use anyhow::Result;
    use database::Database;
    use futures::{SinkExt as _, TryStreamExt as _};
    use nonzero_ext::nonzero;
    use sidecar_store::StorageKey;
    use test_case::test_case;
    use tokio::io::{duplex, AsyncWriteExt as _, DuplexStream};
    use types::primitives::H256;

    use crate::{
        test_utils::{self, AcceptAllProofs, TestBlock},
        verifier::{CommitmentVerifier, VerificationError},
    };

    use super::*;

    type Client =
        BlobSidecarsByRangeClient<HashMap<H256, TestBlock>, CommitmentVerifier<AcceptAllProofs>>;

    const PEER: u64 = 7;

    fn config() -> Arc<Config> {
        Arc::new(Config {
            slots_per_epoch: nonzero!(2_u64),
            min_epochs_for_blob_sidecars_requests: 5,
            ..Config::default()
        })
    }

    fn server(config: &Arc<Config>, slots: &[Slot]) -> Result<BlobSidecarsByRangeServer<u64>> {
        server_with_database(config, Database::in_memory(), slots)
    }

    fn server_with_database(
        config: &Arc<Config>,
        database: Database,
        slots: &[Slot],
    ) -> Result<BlobSidecarsByRangeServer<u64>> {
        let store = SidecarStore::new(database, config, None)?;

        for slot in slots {
            let root_byte = u8::try_from(*slot)?;
            store.put(&*test_utils::sidecar(*slot, root_byte, &[root_byte])?)?;
        }

        Ok(BlobSidecarsByRangeServer::new(
            Arc::clone(config),
            Arc::new(store),
            Arc::new(RateLimiter::from_config(config)),
            None,
        ))
    }

    fn client(config: &Arc<Config>, slots: &[Slot]) -> Result<Client> {
        let blocks = slots
            .iter()
            .map(|slot| {
                let root_byte = u8::try_from(*slot)?;
                let block = test_utils::block(*slot, root_byte, &[root_byte]);
                Ok((block.root, block))
            })
            .collect::<Result<_>>()?;

        Ok(BlobSidecarsByRangeClient::new(
            Arc::clone(config),
            blocks,
            CommitmentVerifier::new(AcceptAllProofs),
            None,
        ))
    }

    async fn exchange(
        server: &BlobSidecarsByRangeServer<u64>,
        client: &Client,
        request: BlobSidecarsByRangeRequest,
        current_slot: Slot,
    ) -> (Result<(), Error>, Result<Vec<Arc<BlobSidecar>>, Error>) {
        let (client_stream, server_stream) = duplex(1 << 20);
        let cancel = CancellationToken::new();

        tokio::join!(
            server.handle_stream(&PEER, server_stream, current_slot, &cancel),
            client.request_blob_sidecars_by_range(client_stream, request),
        )
    }

    fn slots(blob_sidecars: &[Arc<BlobSidecar>]) -> Vec<Slot> {
        blob_sidecars.iter().map(|blob_sidecar| blob_sidecar.slot).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn empty_slots_are_skipped() -> Result<()> {
        let config = config();
        let server = server(&config, &[1, 3])?;
        let client = client(&config, &[1, 3])?;
        let request = BlobSidecarsByRangeRequest {
            start_slot: 0,
            count: 5,
        };

        let start = Instant::now();
        let (served, received) = exchange(&server, &client, request, 4).await;

        served?;
        assert_eq!(slots(&received?), [1, 3]);

        // Paced once after each of the two served slots.
        assert_eq!(start.elapsed(), config.response_pacing_interval * 2);

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn empty_range_closes_stream_without_chunks() -> Result<()> {
        let config = config();
        let server = server(&config, &[1, 3])?;
        let client = client(&config, &[1, 3])?;
        let request = BlobSidecarsByRangeRequest {
            start_slot: 4,
            count: 3,
        };

        let (served, received) = exchange(&server, &client, request, 6).await;

        served?;
        assert!(received?.is_empty());

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn response_is_capped() -> Result<()> {
        let config = Arc::new(Config {
            max_request_blob_sidecars: 2,
            ..Config::clone(&config())
        });

        let server = server(&config, &[1, 2, 3])?;
        let client = client(&config, &[1, 2, 3])?;
        let request = BlobSidecarsByRangeRequest {
            start_slot: 0,
            count: 10,
        };

        let (served, received) = exchange(&server, &client, request, 4).await;

        served?;
        assert_eq!(slots(&received?), [1, 2]);

        Ok(())
    }

    #[test_case(0, 0, 4; "zero count")]
    #[test_case(u64::MAX, 2, 4; "overflowing range")]
    #[test_case(1, 5, 20; "before availability period")]
    #[tokio::test(start_paused = true)]
    async fn invalid_requests_are_rejected(
        start_slot: Slot,
        count: u64,
        current_slot: Slot,
    ) -> Result<()> {
        let config = config();
        let server = server(&config, &[1, 3])?;
        let client = client(&config, &[1, 3])?;
        let request = BlobSidecarsByRangeRequest { start_slot, count };

        let (served, received) = exchange(&server, &client, request, current_slot).await;

        served?;

        assert!(matches!(
            received,
            Err(Error::ErrorResponse {
                code: ResponseCode::InvalidRequest,
                ..
            }),
        ));

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_rate_limit_aborts_response() -> Result<()> {
        let config = Arc::new(Config {
            rate_limit_capacity: SIDECAR_REQUEST_COST * 2,
            rate_limit_refill_per_second: 0,
            ..Config::clone(&config())
        });

        let server = server(&config, &[1, 2, 3])?;
        let client = client(&config, &[1, 2, 3])?;
        let request = BlobSidecarsByRangeRequest {
            start_slot: 1,
            count: 3,
        };

        let (served, received) = exchange(&server, &client, request, 4).await;

        assert!(matches!(served, Err(Error::RateLimited)));

        let Err(Error::ErrorResponse { code, message }) = received else {
            panic!("expected an error response, got {received:?}");
        };

        assert_eq!(code, ResponseCode::ResourceUnavailable);
        assert_eq!(message, "rate limited");

        Ok(())
    }

    // A value at the key for slot 2 that does not decode as a sidecar.
    fn server_with_corrupted_slot_2(
        config: &Arc<Config>,
    ) -> Result<BlobSidecarsByRangeServer<u64>> {
        let database = Database::in_memory();
        let key = StorageKey::new(2, H256::repeat_byte(2), config.retention_window()?);

        database.update(|transaction| transaction.put(key.to_bytes(), [1_u8, 2, 3]))?;

        server_with_database(config, database, &[1, 3])
    }

    #[tokio::test(start_paused = true)]
    async fn storage_failure_is_answered_with_server_error() -> Result<()> {
        let config = config();
        let server = server_with_corrupted_slot_2(&config)?;
        let client = client(&config, &[1, 3])?;
        let request = BlobSidecarsByRangeRequest {
            start_slot: 1,
            count: 3,
        };

        let (served, received) = exchange(&server, &client, request, 4).await;

        assert!(matches!(served, Err(Error::Storage(_))));

        let Err(Error::ErrorResponse { code, .. }) = received else {
            panic!("expected an error response, got {received:?}");
        };

        assert_eq!(code, ResponseCode::ServerError);

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn storage_failure_is_reported_when_error_chunk_cannot_be_sent() -> Result<()> {
        let config = config();
        let server = server_with_corrupted_slot_2(&config)?;
        let (client_stream, server_stream) = duplex(1 << 20);
        let cancel = CancellationToken::new();
        let request = BlobSidecarsByRangeRequest {
            start_slot: 2,
            count: 1,
        };

        drop(client_stream);

        let served = server
            .handle(&PEER, request, 4, server_stream, &cancel)
            .await;

        assert!(matches!(served, Err(Error::Storage(_))));

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_request_is_answered_with_invalid_request() -> Result<()> {
        let config = config();
        let server = server(&config, &[1])?;
        let (mut client_stream, server_stream) = duplex(1 << 10);
        let cancel = CancellationToken::new();

        // A length prefix with nothing after it.
        client_stream.write_all(&[16]).await?;
        client_stream.shutdown().await?;

        let served = server
            .handle_stream(&PEER, server_stream, 4, &cancel)
            .await;

        assert!(matches!(served, Err(Error::Protocol(ProtocolError::TruncatedChunk))));

        let chunks = FramedRead::new(client_stream, ResponseCodec::new(config.max_chunk_size))
            .try_collect::<Vec<_>>()
            .await?;

        assert!(matches!(
            chunks.as_slice(),
            [ResponseChunk::Error {
                code: ResponseCode::InvalidRequest,
                ..
            }],
        ));

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_handler_closes_stream() -> Result<()> {
        let config = config();
        let server = server(&config, &[1, 3])?;
        let client = client(&config, &[1, 3])?;
        let (client_stream, mut server_stream) = duplex(1 << 20);
        let cancel = CancellationToken::new();

        cancel.cancel();

        let request = BlobSidecarsByRangeRequest {
            start_slot: 0,
            count: 5,
        };

        let (served, received) = tokio::join!(
            server.handle(&PEER, request, 4, &mut server_stream, &cancel),
            client.request_blob_sidecars_by_range(client_stream, request),
        );

        assert!(matches!(served, Err(Error::Cancelled)));
        assert!(received?.is_empty());

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn sidecar_failing_verification_discards_response() -> Result<()> {
        let config = config();
        let server = server(&config, &[1, 3])?;

        // The block at slot 3 declares a different commitment than the stored sidecar.
        let mut client = client(&config, &[1])?;
        let block = test_utils::block(3, 3, &[9]);
        client.lookup.insert(block.root, block);

        let request = BlobSidecarsByRangeRequest {
            start_slot: 0,
            count: 5,
        };

        let (served, received) = exchange(&server, &client, request, 4).await;

        served?;

        assert!(matches!(
            received,
            Err(Error::InvalidFetchedData(InvalidFetchedData::VerificationFailed {
                slot: 3,
                source: VerificationError::CommitmentMismatch { index: 0 },
                ..
            })),
        ));

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn sidecars_from_failed_response_are_not_persisted() -> Result<()> {
        let config = config();
        let server = server(&config, &[1, 3])?;
        let local_store = SidecarStore::new(Database::in_memory(), &config, None)?;

        // The sidecar at slot 1 verifies. The one at slot 3 does not.
        let mut client = client(&config, &[1])?;
        let block = test_utils::block(3, 3, &[9]);
        client.lookup.insert(block.root, block);

        let request = BlobSidecarsByRangeRequest {
            start_slot: 0,
            count: 5,
        };

        let (served, received) = exchange(&server, &client, request, 4).await;

        served?;
        assert!(received.is_err());

        for sidecar in received.iter().flatten() {
            local_store.put(sidecar)?;
        }

        assert!(!local_store.has(H256::repeat_byte(1))?);
        assert!(!local_store.has(H256::repeat_byte(3))?);
        assert_eq!(local_store.occupancy()?.sidecars, 0);

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn sidecar_for_unknown_block_is_rejected() -> Result<()> {
        let config = config();
        let server = server(&config, &[1, 3])?;
        let client = client(&config, &[1])?;
        let request = BlobSidecarsByRangeRequest {
            start_slot: 0,
            count: 5,
        };

        let (_, received) = exchange(&server, &client, request, 4).await;

        assert!(matches!(
            received,
            Err(Error::UnknownBlock { block_root }) if block_root == H256::repeat_byte(3),
        ));

        Ok(())
    }

    // Takes the stream by reference so that the client can still write its request to it.
    async fn respond_with(
        chunks: Vec<ResponseChunk>,
        server_stream: &mut DuplexStream,
    ) -> Result<()> {
        let config = config();
        let mut responses =
            FramedWrite::new(server_stream, ResponseCodec::new(config.max_chunk_size));

        for chunk in chunks {
            responses.send(chunk).await?;
        }

        responses.into_inner().shutdown().await?;

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn over_delivery_is_rejected() -> Result<()> {
        let config = Arc::new(Config {
            max_request_blob_sidecars: 2,
            ..Config::clone(&config())
        });

        let client = client(&config, &[1, 2, 3])?;
        let (client_stream, mut server_stream) = duplex(1 << 20);

        let chunks = [1, 2, 3]
            .into_iter()
            .map(|root_byte| {
                let sidecar = test_utils::sidecar(root_byte.into(), root_byte, &[root_byte])?;
                Ok(ResponseChunk::Success(sidecar))
            })
            .collect::<Result<Vec<_>>>()?;

        let request = BlobSidecarsByRangeRequest {
            start_slot: 0,
            count: 5,
        };

        let (responded, received) = tokio::join!(
            respond_with(chunks, &mut server_stream),
            client.request_blob_sidecars_by_range(client_stream, request),
        );

        responded?;

        assert!(matches!(
            received,
            Err(Error::InvalidFetchedData(InvalidFetchedData::TooManySidecars { maximum: 2 })),
        ));

        Ok(())
    }

    #[test_case(&[1, 9]; "outside of requested range")]
    #[test_case(&[3, 1]; "descending slots")]
    #[tokio::test(start_paused = true)]
    async fn misordered_responses_are_rejected(response_slots: &[Slot]) -> Result<()> {
        let config = config();
        let client = client(&config, &[1, 3, 9])?;
        let (client_stream, mut server_stream) = duplex(1 << 20);

        let chunks = response_slots
            .iter()
            .map(|slot| {
                let root_byte = u8::try_from(*slot)?;
                Ok(ResponseChunk::Success(test_utils::sidecar(*slot, root_byte, &[root_byte])?))
            })
            .collect::<Result<Vec<_>>>()?;

        let request = BlobSidecarsByRangeRequest {
            start_slot: 0,
            count: 5,
        };

        let (responded, received) = tokio::join!(
            respond_with(chunks, &mut server_stream),
            client.request_blob_sidecars_by_range(client_stream, request),
        );

        responded?;

        assert!(matches!(received, Err(Error::InvalidFetchedData(_))));

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out() -> Result<()> {
        let config = config();
        let client = client(&config, &[1])?;
        let (client_stream, _server_stream) = duplex(1 << 20);
        let request = BlobSidecarsByRangeRequest {
            start_slot: 0,
            count: 5,
        };

        let start = Instant::now();
        let received = client.request_blob_sidecars_by_range(client_stream, request).await;

        assert!(matches!(
            received,
            Err(Error::Transport(ref error)) if error.kind() == ErrorKind::TimedOut,
        ));
        assert_eq!(start.elapsed(), config.response_timeout);

        Ok(())
    }
}
