use std::time::Duration;

use corral_allocator::{OfferSink, Offers};
use corral_id::{FrameworkId, SlaveId};
use corral_resources::Resources;
use tokio::sync::mpsc;

/// Offers made to one framework in one allocation pass.
#[derive(Debug, Clone)]
pub struct RecordedOffer {
    pub framework_id: FrameworkId,
    pub offers: Offers,
}

impl RecordedOffer {
    /// Everything offered, summed over agents.
    pub fn resources(&self) -> Resources {
        self.offers.values().sum()
    }
}

#[derive(Debug, Clone)]
pub struct Rescission {
    pub framework_id: FrameworkId,
    pub slave_id: SlaveId,
    pub resources: Resources,
}

/// Offer sink that forwards everything to an [`OfferRecorder`].
pub struct RecordingOfferSink {
    offers: mpsc::UnboundedSender<RecordedOffer>,
    rescissions: mpsc::UnboundedSender<Rescission>,
}

impl RecordingOfferSink {
    pub fn channel() -> (Self, OfferRecorder) {
        let (offers_tx, offers_rx) = mpsc::unbounded_channel();
        let (rescissions_tx, rescissions_rx) = mpsc::unbounded_channel();
        (
            Self {
                offers: offers_tx,
                rescissions: rescissions_tx,
            },
            OfferRecorder {
                offers: offers_rx,
                rescissions: rescissions_rx,
            },
        )
    }
}

impl OfferSink for RecordingOfferSink {
    fn offer(&self, framework_id: FrameworkId, offers: Offers) {
        let _ = self.offers.send(RecordedOffer {
            framework_id,
            offers,
        });
    }

    fn rescind(&self, framework_id: FrameworkId, slave_id: SlaveId, resources: &Resources) {
        let _ = self.rescissions.send(Rescission {
            framework_id,
            slave_id,
            resources: resources.clone(),
        });
    }
}

/// Receiving end of a [`RecordingOfferSink`].
pub struct OfferRecorder {
    offers: mpsc::UnboundedReceiver<RecordedOffer>,
    rescissions: mpsc::UnboundedReceiver<Rescission>,
}

impl OfferRecorder {
    /// Waits for the next offer. Panics if none arrives within a minute of
    /// (possibly paused) time.
    pub async fn next(&mut self) -> RecordedOffer {
        tokio::time::timeout(Duration::from_secs(60), self.offers.recv())
            .await
            .expect("timed out waiting for an offer")
            .expect("offer sink dropped")
    }

    /// Returns the next offer if one arrives within `within`.
    pub async fn next_within(&mut self, within: Duration) -> Option<RecordedOffer> {
        tokio::time::timeout(within, self.offers.recv())
            .await
            .ok()
            .flatten()
    }

    /// Asserts that no offer arrives within `within`.
    pub async fn expect_none(&mut self, within: Duration) {
        if let Some(offer) = self.next_within(within).await {
            panic!(
                "unexpected offer to {}: {}",
                offer.framework_id,
                offer.resources()
            );
        }
    }

    /// Rescissions already delivered, without waiting.
    pub fn rescissions(&mut self) -> Vec<Rescission> {
        let mut drained = Vec::new();
        while let Ok(rescission) = self.rescissions.try_recv() {
            drained.push(rescission);
        }
        drained
    }
}
