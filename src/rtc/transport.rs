//! Negotiation discipline for one peer connection.
//!
//! [`RtcTransport`] wraps a [`PeerConnection`] and enforces the SDP rules the
//! raw peer does not: one negotiation at a time, remote candidates buffered
//! until a remote description exists (or an ICE restart completes), and
//! renegotiation requests coalesced while an offer is already in flight.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::protocol::{IceCandidateInit, SessionDescription, SignalTarget};
use crate::rtc::peer::{OfferOptions, PeerConnection, SignalingState};
use crate::utils::debouncer::{debounce, Debouncer};

/// Quiet period before a requested renegotiation actually produces an offer,
/// so bursts of track changes collapse into one round.
pub const NEGOTIATION_DEBOUNCE: Duration = Duration::from_millis(100);

type OfferFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type OfferHandler = Arc<dyn Fn(SessionDescription) -> OfferFuture + Send + Sync>;

pub struct RtcTransport {
    target: SignalTarget,
    peer: Arc<dyn PeerConnection>,
    /// Serializes every SDP operation on this transport.
    negotiation: AsyncMutex<()>,
    /// Remote candidates that arrived before they could be applied, in
    /// arrival order.
    pending_candidates: Mutex<Vec<IceCandidateInit>>,
    /// While set, candidates buffer even though a (stale) remote description
    /// exists.
    restarting_ice: AtomicBool,
    /// An offer was requested while another was in flight; run one more
    /// negotiation once the answer lands.
    renegotiate: AtomicBool,
    debouncer: Mutex<Option<Debouncer>>,
    offer_handler: Mutex<Option<OfferHandler>>,
}

impl RtcTransport {
    pub fn new(target: SignalTarget, peer: Arc<dyn PeerConnection>) -> Self {
        Self {
            target,
            peer,
            negotiation: AsyncMutex::new(()),
            pending_candidates: Mutex::new(Vec::new()),
            restarting_ice: AtomicBool::new(false),
            renegotiate: AtomicBool::new(false),
            debouncer: Mutex::new(None),
            offer_handler: Mutex::new(None),
        }
    }

    pub fn target(&self) -> SignalTarget {
        self.target
    }

    pub fn peer(&self) -> &Arc<dyn PeerConnection> {
        &self.peer
    }

    pub fn is_connected(&self) -> bool {
        self.peer.state() == crate::rtc::peer::PeerState::Connected
    }

    /// Install the callback that delivers locally created offers, typically
    /// into the signal client.
    pub fn on_offer<F, Fut>(&self, handler: F)
    where
        F: Fn(SessionDescription) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        *self.offer_handler.lock() = Some(Arc::new(move |sd| {
            Box::pin(handler(sd)) as OfferFuture
        }));
    }

    /// Deliver a locally applied offer to the installed handler. Cloned out
    /// of the lock so the handler runs without holding it.
    async fn fire_offer(&self, offer: SessionDescription) {
        let handler = self.offer_handler.lock().clone();
        match handler {
            Some(handler) => handler(offer).await,
            None => warn!(target = ?self.target, "offer created with no handler installed"),
        }
    }

    /// Request a renegotiation after the debounce window. Calls within the
    /// window collapse into a single offer.
    pub fn negotiate(self: &Arc<Self>) {
        let mut guard = self.debouncer.lock();
        if let Some(debouncer) = guard.as_ref() {
            if debouncer.call().is_ok() {
                return;
            }
        }
        let this = Arc::clone(self);
        *guard = Some(debounce(NEGOTIATION_DEBOUNCE, async move {
            if let Err(e) = this.create_and_send_offer(OfferOptions::default()).await {
                error!(target = ?this.target, "negotiation failed: {e}");
            }
        }));
    }

    /// Create an offer, apply it locally and hand it to the offer handler.
    ///
    /// If an earlier offer is still unanswered the request is coalesced into
    /// the `renegotiate` flag unless this is an ICE restart, which instead
    /// rolls the old remote description back in before offering again.
    pub async fn create_and_send_offer(&self, options: OfferOptions) -> Result<()> {
        let _guard = self.negotiation.lock().await;
        if self.peer.signaling_state() == SignalingState::Closed {
            return Ok(());
        }
        if options.ice_restart {
            self.restarting_ice.store(true, Ordering::SeqCst);
        }
        match self.peer.signaling_state() {
            SignalingState::HaveLocalOffer if options.ice_restart => {
                if let Some(remote) = self.peer.remote_description() {
                    self.peer.set_remote_description(remote).await?;
                }
            }
            SignalingState::HaveLocalOffer => {
                debug!(target = ?self.target, "offer in flight, queueing renegotiation");
                self.renegotiate.store(true, Ordering::SeqCst);
                return Ok(());
            }
            _ => {}
        }
        let offer = self.peer.create_offer(options).await?;
        self.peer.set_local_description(offer.clone()).await?;
        self.fire_offer(offer).await;
        Ok(())
    }

    /// Apply a remote description, flush candidates buffered while it was
    /// missing, and run any negotiation queued behind the in-flight offer.
    pub async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let _guard = self.negotiation.lock().await;
        self.peer.set_remote_description(description).await?;

        let buffered: Vec<_> = self.pending_candidates.lock().drain(..).collect();
        for candidate in buffered {
            if let Err(e) = self.peer.add_ice_candidate(candidate).await {
                warn!(target = ?self.target, "failed to apply buffered candidate: {e}");
            }
        }
        self.restarting_ice.store(false, Ordering::SeqCst);

        if self.renegotiate.swap(false, Ordering::SeqCst) {
            debug!(target = ?self.target, "running queued renegotiation");
            let offer = self.peer.create_offer(OfferOptions::default()).await?;
            self.peer.set_local_description(offer.clone()).await?;
            self.fire_offer(offer).await;
        }
        Ok(())
    }

    /// Apply a remote candidate, or buffer it while there is nothing to
    /// apply it against.
    pub async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<()> {
        if self.peer.remote_description().is_none() || self.restarting_ice.load(Ordering::SeqCst) {
            debug!(target = ?self.target, "buffering remote ice candidate");
            self.pending_candidates.lock().push(candidate);
            return Ok(());
        }
        self.peer.add_ice_candidate(candidate).await
    }

    /// Mark the transport as restarting so candidates for the stale ICE
    /// session buffer until the server's restart offer is applied.
    pub fn prepare_ice_restart(&self) {
        debug!(target = ?self.target, "preparing for ice restart");
        self.restarting_ice.store(true, Ordering::SeqCst);
    }

    pub async fn close(&self) {
        // Cancel any pending debounced negotiation before closing the peer.
        *self.debouncer.lock() = None;
        self.peer.close().await;
    }
}

impl std::fmt::Debug for RtcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtcTransport")
            .field("target", &self.target)
            .field("state", &self.peer.state())
            .finish()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::error::RoomWireError;
    use crate::media::LocalMediaTrack;
    use crate::protocol::{SdpKind, TrackCid, VideoLayer};
    use crate::rtc::peer::{
        DataChannel, DataChannelInit, PeerState, SignalingState,
    };
    use async_trait::async_trait;

    #[derive(Default)]
    struct MockPeer {
        signaling: Mutex<Option<SignalingState>>,
        local: Mutex<Option<SessionDescription>>,
        remote: Mutex<Option<SessionDescription>>,
        applied_candidates: Mutex<Vec<IceCandidateInit>>,
        offers_created: Mutex<u32>,
        remote_sets: Mutex<u32>,
    }

    impl MockPeer {
        fn set_signaling(&self, state: SignalingState) {
            *self.signaling.lock() = Some(state);
        }

        fn seed_remote(&self, sdp: &str) {
            *self.remote.lock() = Some(SessionDescription {
                kind: SdpKind::Answer,
                sdp: sdp.into(),
            });
        }
    }

    #[async_trait]
    impl PeerConnection for MockPeer {
        async fn create_offer(&self, _options: OfferOptions) -> Result<SessionDescription> {
            let mut count = self.offers_created.lock();
            *count += 1;
            Ok(SessionDescription {
                kind: SdpKind::Offer,
                sdp: format!("offer-{}", *count),
            })
        }

        async fn create_answer(&self) -> Result<SessionDescription> {
            Ok(SessionDescription {
                kind: SdpKind::Answer,
                sdp: "answer".into(),
            })
        }

        async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
            *self.local.lock() = Some(description);
            Ok(())
        }

        async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
            *self.remote_sets.lock() += 1;
            *self.remote.lock() = Some(description);
            *self.signaling.lock() = Some(SignalingState::Stable);
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<()> {
            self.applied_candidates.lock().push(candidate);
            Ok(())
        }

        fn signaling_state(&self) -> SignalingState {
            self.signaling.lock().unwrap_or(SignalingState::Stable)
        }

        fn state(&self) -> PeerState {
            PeerState::New
        }

        fn local_description(&self) -> Option<SessionDescription> {
            self.local.lock().clone()
        }

        fn remote_description(&self) -> Option<SessionDescription> {
            self.remote.lock().clone()
        }

        async fn create_data_channel(
            &self,
            _label: &str,
            _init: DataChannelInit,
        ) -> Result<Arc<dyn DataChannel>> {
            Err(RoomWireError::Media("not supported by mock".into()))
        }

        async fn add_track(
            &self,
            _cid: TrackCid,
            _track: Arc<dyn LocalMediaTrack>,
            _layers: Vec<VideoLayer>,
        ) -> Result<()> {
            Ok(())
        }

        async fn remove_track(&self, _cid: &str) -> Result<()> {
            Ok(())
        }

        async fn close(&self) {
            *self.signaling.lock() = Some(SignalingState::Closed);
        }
    }

    fn candidate(tag: &str) -> IceCandidateInit {
        IceCandidateInit {
            candidate: format!("candidate:{tag}"),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        }
    }

    fn transport() -> (Arc<RtcTransport>, Arc<MockPeer>) {
        let peer = Arc::new(MockPeer::default());
        let transport = Arc::new(RtcTransport::new(
            SignalTarget::Publisher,
            Arc::clone(&peer) as Arc<dyn PeerConnection>,
        ));
        (transport, peer)
    }

    #[tokio::test]
    async fn candidates_buffer_until_remote_description_arrives() {
        let (transport, peer) = transport();

        transport.add_ice_candidate(candidate("a")).await.unwrap();
        transport.add_ice_candidate(candidate("b")).await.unwrap();
        assert!(peer.applied_candidates.lock().is_empty());

        transport
            .set_remote_description(SessionDescription {
                kind: SdpKind::Answer,
                sdp: "v=0".into(),
            })
            .await
            .unwrap();

        let applied = peer.applied_candidates.lock();
        assert_eq!(applied.len(), 2);
        assert_eq!(applied[0].candidate, "candidate:a");
        assert_eq!(applied[1].candidate, "candidate:b");
    }

    #[tokio::test]
    async fn candidates_apply_directly_once_remote_description_exists() {
        let (transport, peer) = transport();
        peer.seed_remote("v=0");

        transport.add_ice_candidate(candidate("a")).await.unwrap();
        assert_eq!(peer.applied_candidates.lock().len(), 1);
    }

    #[tokio::test]
    async fn offer_while_awaiting_answer_coalesces_into_one() {
        let (transport, peer) = transport();
        let offers = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&offers);
        transport.on_offer(move |sd| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().push(sd.sdp);
            }
        });

        peer.set_signaling(SignalingState::HaveLocalOffer);
        transport
            .create_and_send_offer(OfferOptions::default())
            .await
            .unwrap();
        assert_eq!(*peer.offers_created.lock(), 0);

        // The answer lands; the queued renegotiation runs exactly once.
        transport
            .set_remote_description(SessionDescription {
                kind: SdpKind::Answer,
                sdp: "v=0".into(),
            })
            .await
            .unwrap();
        assert_eq!(*peer.offers_created.lock(), 1);
        assert_eq!(offers.lock().as_slice(), ["offer-1".to_string()]);
    }

    #[tokio::test]
    async fn ice_restart_rolls_back_the_stale_remote_description() {
        let (transport, peer) = transport();
        transport.on_offer(|_sd| async {});
        peer.seed_remote("stale");
        peer.set_signaling(SignalingState::HaveLocalOffer);

        transport
            .create_and_send_offer(OfferOptions { ice_restart: true })
            .await
            .unwrap();

        // Stale remote reapplied, then a fresh restart offer created.
        assert_eq!(*peer.remote_sets.lock(), 1);
        assert_eq!(*peer.offers_created.lock(), 1);
    }

    #[tokio::test]
    async fn prepare_ice_restart_buffers_despite_remote_description() {
        let (transport, peer) = transport();
        peer.seed_remote("v=0");
        transport.prepare_ice_restart();

        transport.add_ice_candidate(candidate("a")).await.unwrap();
        assert!(peer.applied_candidates.lock().is_empty());

        transport
            .set_remote_description(SessionDescription {
                kind: SdpKind::Offer,
                sdp: "restarted".into(),
            })
            .await
            .unwrap();
        assert_eq!(peer.applied_candidates.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn negotiate_debounces_bursts_into_one_offer() {
        let (transport, peer) = transport();
        transport.on_offer(|_sd| async {});

        transport.negotiate();
        transport.negotiate();
        transport.negotiate();

        tokio::time::sleep(NEGOTIATION_DEBOUNCE * 3).await;
        tokio::task::yield_now().await;
        assert_eq!(*peer.offers_created.lock(), 1);

        // A later burst gets its own debouncer and its own offer.
        transport.negotiate();
        tokio::time::sleep(NEGOTIATION_DEBOUNCE * 3).await;
        tokio::task::yield_now().await;
        assert_eq!(*peer.offers_created.lock(), 2);
    }
}
