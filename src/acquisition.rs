//! Acquisition runs: extract, tag and catalog one source or a whole playlist,
//! strictly one item at a time.

use crate::catalog::{Catalog, TrackMetadata};
use crate::error::{Error, ErrorKind, Result};
use crate::extractor::TrackExtractor;
use crate::playlist::PlaylistResolver;
use crate::tagger::Tagger;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Per-item pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Extracting,
    Tagging,
    Cataloging,
    Halted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Start,
    Extracted,
    Tagged,
    Cataloged,
    Fail,
}

impl Stage {
    /// The stage reached by applying `transition`, or `None` if it is not
    /// allowed from here.
    pub fn next(self, transition: Transition) -> Option<Stage> {
        use Stage::*;
        use Transition::*;
        match (self, transition) {
            (Idle | Halted, Start) => Some(Extracting),
            (Extracting, Extracted) => Some(Tagging),
            (Tagging, Tagged) => Some(Cataloging),
            (Cataloging, Cataloged) => Some(Idle),
            (Extracting | Tagging | Cataloging, Fail) => Some(Halted),
            _ => None,
        }
    }

    pub fn is_busy(self) -> bool {
        matches!(self, Stage::Extracting | Stage::Tagging | Stage::Cataloging)
    }
}

/// Notifications emitted while a run progresses.
#[derive(Debug, Clone, PartialEq)]
pub enum AcquisitionEvent {
    RunStarted {
        total: usize,
        batch: bool,
    },
    ItemStarted {
        index: usize,
        total: usize,
        reference: String,
    },
    StageChanged(Stage),
    Progress {
        index: usize,
        percent: f32,
    },
    ItemCompleted {
        index: usize,
        path: PathBuf,
        metadata: TrackMetadata,
        inserted: bool,
    },
    /// A single-item run failed.
    ItemFailed {
        reference: String,
        kind: ErrorKind,
        message: String,
    },
    /// Every item of a batch run was cataloged.
    BatchCompleted {
        processed: usize,
    },
    /// A batch run stopped at `reference`; the rest of the queue was dropped.
    BatchHalted {
        reference: String,
        kind: ErrorKind,
        message: String,
        processed: usize,
        discarded: usize,
    },
}

/// Result of a run that completed without error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub items: usize,
    /// New catalog rows; items already cataloged are not counted.
    pub inserted: usize,
}

pub struct AcquisitionManager {
    extractor: Arc<dyn TrackExtractor>,
    tagger: Arc<Tagger>,
    catalog: Arc<Catalog>,
    resolver: Option<Arc<dyn PlaylistResolver>>,
    batch_delay: Duration,
    queue: VecDeque<String>,
    batch: bool,
    stage: Stage,
}

impl AcquisitionManager {
    pub fn new(
        extractor: Arc<dyn TrackExtractor>,
        tagger: Arc<Tagger>,
        catalog: Arc<Catalog>,
        batch_delay: Duration,
    ) -> Self {
        Self {
            extractor,
            tagger,
            catalog,
            resolver: None,
            batch_delay,
            queue: VecDeque::new(),
            batch: false,
            stage: Stage::Idle,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn PlaylistResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    fn transition(&mut self, transition: Transition, events: &mut dyn FnMut(AcquisitionEvent)) {
        match self.stage.next(transition) {
            Some(next) => {
                debug!("Stage {:?} -> {:?}", self.stage, next);
                self.stage = next;
                events(AcquisitionEvent::StageChanged(next));
            }
            None => {
                error!("Invalid stage transition {:?} from {:?}", transition, self.stage);
            }
        }
    }

    /// Queue `reference` (expanding playlists) and process it as one run.
    ///
    /// A playlist run is a batch: the first failure drops the remaining queue,
    /// leaves the manager `Halted` and is returned as the run's error.
    pub fn submit(
        &mut self,
        reference: &str,
        events: &mut dyn FnMut(AcquisitionEvent),
    ) -> Result<RunSummary> {
        let playlist = self
            .resolver
            .as_ref()
            .filter(|resolver| resolver.is_playlist(reference))
            .cloned();

        match playlist {
            Some(resolver) => {
                let items = match resolver.resolve(reference) {
                    Ok(items) => items,
                    Err(e) => {
                        warn!("Could not resolve playlist {}: {}", reference, e);
                        events(AcquisitionEvent::ItemFailed {
                            reference: reference.to_string(),
                            kind: e.kind(),
                            message: e.to_string(),
                        });
                        return Err(e);
                    }
                };
                info!("Queued playlist with {} tracks", items.len());
                self.queue.extend(items);
                self.batch = true;
            }
            None => {
                self.queue.push_back(reference.trim().to_string());
                self.batch = false;
            }
        }

        self.run(events)
    }

    fn run(&mut self, events: &mut dyn FnMut(AcquisitionEvent)) -> Result<RunSummary> {
        let total = self.queue.len();
        events(AcquisitionEvent::RunStarted {
            total,
            batch: self.batch,
        });

        let mut summary = RunSummary::default();
        let mut index = 0;

        while let Some(reference) = self.queue.pop_front() {
            if index > 0 && !self.batch_delay.is_zero() {
                std::thread::sleep(self.batch_delay);
            }

            events(AcquisitionEvent::ItemStarted {
                index,
                total,
                reference: reference.clone(),
            });

            match self.process_item(index, &reference, events) {
                Ok(inserted) => {
                    summary.items += 1;
                    if inserted {
                        summary.inserted += 1;
                    }
                }
                Err(e) => {
                    self.transition(Transition::Fail, events);
                    let discarded = self.queue.len();
                    self.queue.clear();

                    if self.batch {
                        error!(
                            "Batch halted at '{}' after {} items ({} discarded): {}",
                            reference, summary.items, discarded, e
                        );
                        events(AcquisitionEvent::BatchHalted {
                            reference,
                            kind: e.kind(),
                            message: e.to_string(),
                            processed: summary.items,
                            discarded,
                        });
                    } else {
                        error!("Acquisition failed for '{}': {}", reference, e);
                        events(AcquisitionEvent::ItemFailed {
                            reference,
                            kind: e.kind(),
                            message: e.to_string(),
                        });
                    }
                    self.batch = false;
                    return Err(e);
                }
            }
            index += 1;
        }

        if self.batch {
            info!("Batch complete: {} items", summary.items);
            events(AcquisitionEvent::BatchCompleted {
                processed: summary.items,
            });
        }
        self.batch = false;
        Ok(summary)
    }

    /// Extract, tag and catalog one reference. Returns whether a row was added.
    fn process_item(
        &mut self,
        index: usize,
        reference: &str,
        events: &mut dyn FnMut(AcquisitionEvent),
    ) -> Result<bool> {
        self.transition(Transition::Start, events);

        let extracted = {
            let mut on_progress = |percent: f32| events(AcquisitionEvent::Progress { index, percent });
            self.extractor.extract(reference, &mut on_progress)?
        };
        if !extracted.path.is_file() {
            return Err(Error::extraction(
                reference,
                format!("output file missing: {}", extracted.path.display()),
            ));
        }
        self.transition(Transition::Extracted, events);

        let tagged = self.tagger.tag(&extracted.path, &extracted.title)?;
        self.transition(Transition::Tagged, events);

        let inserted = self.catalog.add_track(&tagged.path, &tagged.metadata)?;
        self.transition(Transition::Cataloged, events);

        events(AcquisitionEvent::ItemCompleted {
            index,
            path: tagged.path,
            metadata: tagged.metadata,
            inserted,
        });
        Ok(inserted)
    }
}

struct Submission {
    reference: String,
    reply: oneshot::Sender<Result<RunSummary>>,
}

/// Background worker owning an [`AcquisitionManager`].
///
/// Submissions are processed in order, each as its own run; one that arrives
/// while a run is active waits in the channel until the run ends.
pub struct AcquisitionHandle {
    tx: mpsc::UnboundedSender<Submission>,
    worker: JoinHandle<()>,
}

impl AcquisitionHandle {
    /// Start the worker. Events from every run arrive on the returned receiver.
    pub fn spawn(
        manager: AcquisitionManager,
    ) -> (Self, mpsc::UnboundedReceiver<AcquisitionEvent>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Submission>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let worker = tokio::spawn(async move {
            let mut manager = manager;
            while let Some(submission) = rx.recv().await {
                let event_tx = event_tx.clone();
                let joined = tokio::task::spawn_blocking(move || {
                    let result = manager.submit(&submission.reference, &mut |event| {
                        let _ = event_tx.send(event);
                    });
                    (manager, submission.reply, result)
                })
                .await;

                match joined {
                    Ok((returned, reply, result)) => {
                        manager = returned;
                        let _ = reply.send(result);
                    }
                    Err(e) => {
                        error!("Acquisition worker panicked: {}", e);
                        return;
                    }
                }
            }
            // Collaborators may own blocking HTTP clients, which must not be
            // dropped on a runtime thread.
            let _ = tokio::task::spawn_blocking(move || drop(manager)).await;
            debug!("Acquisition worker stopped");
        });

        (Self { tx, worker }, event_rx)
    }

    /// Queue a reference; the receiver resolves when its run ends.
    pub fn submit(&self, reference: impl Into<String>) -> oneshot::Receiver<Result<RunSummary>> {
        let (reply, rx) = oneshot::channel();
        let submission = Submission {
            reference: reference.into(),
            reply,
        };
        if let Err(mpsc::error::SendError(submission)) = self.tx.send(submission) {
            // Worker is gone; dropping the sender closes the receiver.
            warn!("Acquisition worker not running, dropping '{}'", submission.reference);
        }
        rx
    }

    /// Stop accepting submissions and wait for queued runs to finish.
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.worker.await {
            error!("Acquisition worker failed: {}", e);
        }
    }
}
