//! The connection pool: keeps up to `max_connections` peer tasks alive, feeds
//! them addresses from the tracker and tears everything down on completion or
//! stop.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::ClientConfig,
    error::ApplicationError,
    manager::{PieceManager, Progress},
    peer::{self, CloseReason, PeerContext},
    tracker::{AnnounceEvent, AnnounceRequest, Announcer},
};

type PeerResult = (SocketAddr, Result<CloseReason, ApplicationError>);

/// When the next announce is due
#[derive(Debug)]
struct AnnounceSchedule {
    last:     Option<Instant>,
    interval: Duration,
    started:  bool,
}

impl AnnounceSchedule {
    fn new(interval: Duration) -> Self {
        Self {
            last: None,
            interval,
            started: false,
        }
    }

    /// Due once the interval has passed, or after `min_wait` when we have
    /// run out of addresses to try.
    fn is_due(&self, now: Instant, starving: bool, min_wait: Duration) -> bool {
        match self.last {
            None => true,
            Some(last) => {
                let elapsed = now.duration_since(last);
                elapsed >= self.interval || (starving && elapsed >= min_wait)
            }
        }
    }

    fn event(&self) -> AnnounceEvent {
        if self.started {
            AnnounceEvent::Empty
        } else {
            AnnounceEvent::Started
        }
    }
}

/// Downloads one torrent from the swarm.
pub struct TorrentClient {
    info_hash: [u8; 20],
    config:    Arc<ClientConfig>,
    manager:   Arc<PieceManager>,
    tracker:   Arc<dyn Announcer>,
    shutdown:  CancellationToken,
    running:   watch::Sender<bool>,
}

impl TorrentClient {
    pub fn new(
        info_hash: [u8; 20],
        config: ClientConfig,
        manager: Arc<PieceManager>,
        tracker: Arc<dyn Announcer>,
    ) -> Self {
        let (running, _) = watch::channel(false);
        Self {
            info_hash,
            config: Arc::new(config),
            manager,
            tracker,
            shutdown: CancellationToken::new(),
            running,
        }
    }

    /// Runs the download.
    ///
    /// Returns once every piece is written or [`TorrentClient::stop`] was
    /// called, and only after every peer task has finished. A client cannot
    /// be started again after it stopped.
    pub async fn start(&self) -> Result<(), ApplicationError> {
        self.running.send_replace(true);
        info!(info_hash = %hex::encode(self.info_hash), "client started");

        let peers_token = self.shutdown.child_token();
        let mut actors: JoinSet<PeerResult> = JoinSet::new();
        let mut live: HashSet<SocketAddr> = HashSet::new();
        let mut queue: VecDeque<SocketAddr> = VecDeque::new();
        let mut schedule = AnnounceSchedule::new(self.config.default_announce_interval);
        let mut completed = self.manager.subscribe();

        let mut tick = time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_progress: Option<Progress> = None;
        let mut reported_idle = false;

        loop {
            if *completed.borrow() || self.shutdown.is_cancelled() {
                break;
            }

            if schedule.is_due(Instant::now(), queue.is_empty(), self.config.min_announce_interval) {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = self.announce(&mut schedule, &mut queue, &live) => {}
                }
            }

            self.fill_slots(&mut actors, &mut live, &mut queue, &peers_token);

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = completed.changed() => {}
                Some(joined) = actors.join_next(), if !actors.is_empty() => {
                    reap(joined, &mut live);
                }
                _ = tick.tick() => {
                    self.manager.sweep_stale(self.config.request_timeout).await;

                    let progress = self.manager.progress().await;
                    if last_progress != Some(progress) {
                        info!(
                            pieces = progress.pieces_done,
                            total = progress.pieces_total,
                            bytes = progress.bytes_done,
                            peers = actors.len(),
                            "progress"
                        );
                        last_progress = Some(progress);
                    }

                    let idle = actors.is_empty() && queue.is_empty();
                    if idle && !reported_idle {
                        info!("idle: no peers, waiting for the tracker");
                    }
                    reported_idle = idle;
                }
            }
        }

        debug!(peers = actors.len(), "closing peer connections");
        peers_token.cancel();
        while let Some(joined) = actors.join_next().await {
            reap(joined, &mut live);
        }

        self.announce_final(&schedule).await;

        if self.manager.is_complete().await {
            info!("download complete");
        } else {
            info!("client stopped");
        }
        self.running.send_replace(false);
        Ok(())
    }

    /// Asks [`TorrentClient::start`] to wind down and waits until it has.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let mut running = self.running.subscribe();
        let _ = running.wait_for(|running| !*running).await;
    }

    fn fill_slots(
        &self,
        actors: &mut JoinSet<PeerResult>,
        live: &mut HashSet<SocketAddr>,
        queue: &mut VecDeque<SocketAddr>,
        token: &CancellationToken,
    ) {
        while actors.len() < self.config.max_connections {
            let Some(addr) = queue.pop_front() else {
                break;
            };
            if !live.insert(addr) {
                continue;
            }

            let ctx = PeerContext {
                info_hash: self.info_hash,
                manager: self.manager.clone(),
                config: self.config.clone(),
            };
            let cancel = token.child_token();
            actors.spawn(async move { (addr, peer::run(addr, ctx, cancel).await) });
        }
    }

    async fn announce(
        &self,
        schedule: &mut AnnounceSchedule,
        queue: &mut VecDeque<SocketAddr>,
        live: &HashSet<SocketAddr>,
    ) {
        let request = self.announce_request(schedule.event()).await;
        schedule.last = Some(Instant::now());

        match self.tracker.announce(&request).await {
            Ok(response) => {
                schedule.started = true;
                schedule.interval = response
                    .interval
                    .map(Duration::from_secs)
                    .unwrap_or(self.config.default_announce_interval)
                    .max(self.config.min_announce_interval);

                let before = queue.len();
                for addr in response.peers {
                    if !live.contains(&addr) && !queue.contains(&addr) {
                        queue.push_back(addr);
                    }
                }
                info!(
                    received = queue.len() - before,
                    queued = queue.len(),
                    next_in = schedule.interval.as_secs(),
                    "tracker announce"
                );
            }
            Err(e) => {
                schedule.interval = self.config.min_announce_interval;
                warn!(error = %e, retry_in = schedule.interval.as_secs(), "announce failed");
            }
        }
    }

    /// Best-effort goodbye to the tracker, bounded by
    /// `final_announce_timeout` so an unreachable tracker cannot hold up
    /// shutdown.
    async fn announce_final(&self, schedule: &AnnounceSchedule) {
        let event = if self.manager.is_complete().await {
            AnnounceEvent::Completed
        } else if schedule.started {
            AnnounceEvent::Stopped
        } else {
            return;
        };

        let request = self.announce_request(event).await;
        match time::timeout(
            self.config.final_announce_timeout,
            self.tracker.announce(&request),
        )
        .await
        {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, ?event, "final announce failed"),
            Err(_) => warn!(?event, "final announce timed out"),
        }
    }

    async fn announce_request(&self, event: AnnounceEvent) -> AnnounceRequest {
        let progress = self.manager.progress().await;
        AnnounceRequest {
            info_hash: self.info_hash,
            peer_id: self.config.peer_id,
            port: self.config.port,
            uploaded: 0,
            downloaded: progress.bytes_done,
            left: progress.bytes_left(),
            event,
        }
    }
}

fn reap(joined: Result<PeerResult, JoinError>, live: &mut HashSet<SocketAddr>) {
    match joined {
        Ok((addr, result)) => {
            live.remove(&addr);
            if let Err(e) = result {
                debug!(%addr, error = %e, "peer dropped");
            }
        }
        Err(e) => error!(error = %e, "peer task failed"),
    }
}
