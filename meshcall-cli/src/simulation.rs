//! In-process mesh simulation
//!
//! Every participant is a full [`CallEngine`] with its own peer connections,
//! talking to the others through one [`LoopbackHub`].

use anyhow::{ensure, Context, Result};
use meshcall_core::prelude::*;
use meshcall_core::types::ConnectionQuality;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const GROUP: &str = "simulation";
const SETTLE_POLL: Duration = Duration::from_millis(50);
const SETTLE_ATTEMPTS: u32 = 100;

/// What to simulate
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    /// Number of engines, initiator included
    pub participants: usize,
    /// Audio or video call
    pub call_type: CallType,
    /// How long the call runs before the initiator ends it
    pub duration: Duration,
}

/// One participant's view of the mesh
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantSummary {
    pub user: UserId,
    pub state: CallState,
    pub connections: usize,
    pub links: Vec<(UserId, ConnectionQuality)>,
    pub remote_tracks: usize,
    pub camera_unavailable: bool,
}

impl ParticipantSummary {
    async fn capture(engine: &CallEngine) -> Self {
        let orchestrator = engine.orchestrator();
        let snapshot = engine.snapshot();
        let user = orchestrator.local_user().id.clone();
        let mut links: Vec<_> = snapshot
            .call
            .iter()
            .flat_map(|c| c.participants.values())
            .filter(|p| p.user_id != user)
            .map(|p| (p.user_id.clone(), p.connection_quality))
            .collect();
        links.sort_by(|a, b| a.0.cmp(&b.0));

        Self {
            state: snapshot.state,
            connections: orchestrator.connection_count().await,
            links,
            remote_tracks: orchestrator
                .remote_streams()
                .values()
                .map(|s| s.tracks.len())
                .sum(),
            camera_unavailable: snapshot.camera_unavailable,
            user,
        }
    }

    /// Every remote participant has a good link
    pub fn fully_connected(&self) -> bool {
        !self.links.is_empty()
            && self.connections == self.links.len()
            && self.links.iter().all(|(_, q)| *q == ConnectionQuality::Good)
    }
}

impl fmt::Display for ParticipantSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<16} {:<22} connections={} remote_tracks={}",
            self.user.as_str(),
            format!("{:?}", self.state),
            self.connections,
            self.remote_tracks
        )?;
        if self.camera_unavailable {
            write!(f, " (camera unavailable)")?;
        }
        for (user, quality) in &self.links {
            write!(f, "\n    -> {:<16} {:?}", user.as_str(), quality)?;
        }
        Ok(())
    }
}

fn build_engine(hub: &Arc<LoopbackHub>, base: &EngineConfig, index: usize) -> Result<CallEngine> {
    let user = LocalUser::new(
        format!("participant-{index}"),
        format!("Participant {index}"),
    );
    let engine = CallEngine::builder()
        .with_config(EngineConfig {
            local_user: user.clone(),
            ..base.clone()
        })
        .with_gateway(hub.connect(&user))
        .with_directory(hub.clone())
        .with_devices(Arc::new(SyntheticDevices::new()))
        .build()
        .with_context(|| format!("building engine for {}", user.id))?;
    engine.start()?;
    Ok(engine)
}

async fn summarize(engines: &[CallEngine]) -> Vec<ParticipantSummary> {
    let mut summaries = Vec::with_capacity(engines.len());
    for engine in engines {
        summaries.push(ParticipantSummary::capture(engine).await);
    }
    summaries
}

/// Run a call across `options.participants` engines
///
/// The first engine starts the call, the rest join it. Returns each
/// participant's summary taken just before the initiator ends the call.
pub async fn run(config: &EngineConfig, options: &SimulationOptions) -> Result<Vec<ParticipantSummary>> {
    ensure!(
        options.participants >= 2,
        "a mesh needs at least 2 participants, got {}",
        options.participants
    );

    let hub = LoopbackHub::new();
    let engines = (0..options.participants)
        .map(|i| build_engine(&hub, config, i))
        .collect::<Result<Vec<_>>>()?;
    let Some((initiator, joiners)) = engines.split_first() else {
        anyhow::bail!("no engines were built");
    };

    let outcome = initiator
        .start_call(GroupId::new(GROUP), options.call_type)
        .await
        .context("starting the call")?;
    let call_id = outcome
        .call_id()
        .context("start did not produce a call")?;
    println!("📞 {} started call {}", initiator.orchestrator().local_user().id, call_id);

    for engine in joiners {
        let outcome = engine.join_call(call_id).await?;
        println!("   {} -> {:?}", engine.orchestrator().local_user().id, outcome);
    }

    // Let the links settle, bounded by the requested duration
    let deadline = tokio::time::Instant::now() + options.duration;
    for _ in 0..SETTLE_ATTEMPTS {
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        if summarize(&engines).await.iter().all(ParticipantSummary::fully_connected) {
            tracing::info!("Mesh fully connected");
            break;
        }
        tokio::time::sleep(SETTLE_POLL).await;
    }
    tokio::time::sleep_until(deadline).await;

    let summaries = summarize(&engines).await;
    println!();
    println!("📊 Mesh after {:?}", options.duration);
    for summary in &summaries {
        println!("{summary}");
    }

    initiator.end_call().await.context("ending the call")?;
    for engine in &engines {
        engine.shutdown().await;
    }
    println!();
    println!("📞 Call ended");
    Ok(summaries)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn summary(links: Vec<(&str, ConnectionQuality)>, connections: usize) -> ParticipantSummary {
        ParticipantSummary {
            user: UserId::new("participant-0"),
            state: CallState::Active,
            connections,
            links: links
                .into_iter()
                .map(|(u, q)| (UserId::new(u), q))
                .collect(),
            remote_tracks: 2,
            camera_unavailable: false,
        }
    }

    #[test]
    fn test_fully_connected_needs_good_links_for_everyone() {
        let good = summary(
            vec![
                ("participant-1", ConnectionQuality::Good),
                ("participant-2", ConnectionQuality::Good),
            ],
            2,
        );
        assert!(good.fully_connected());

        let degraded = summary(
            vec![
                ("participant-1", ConnectionQuality::Good),
                ("participant-2", ConnectionQuality::Degraded),
            ],
            2,
        );
        assert!(!degraded.fully_connected());

        let missing_entry = summary(vec![("participant-1", ConnectionQuality::Good)], 0);
        assert!(!missing_entry.fully_connected());

        assert!(!summary(Vec::new(), 0).fully_connected());
    }

    #[test]
    fn test_display_lists_links() {
        let rendered = summary(vec![("participant-1", ConnectionQuality::Good)], 1).to_string();
        let lines: Vec<_> = rendered.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("participant-0"));
        assert!(lines[0].contains("connections=1"));
        assert!(lines[1].contains("participant-1"));
        assert!(lines[1].contains("Good"));
    }

    #[tokio::test]
    async fn test_single_participant_is_rejected() {
        let options = SimulationOptions {
            participants: 1,
            call_type: CallType::Audio,
            duration: Duration::from_millis(10),
        };
        let err = run(&EngineConfig::default(), &options).await.unwrap_err();
        assert!(err.to_string().contains("at least 2"));
    }
}
