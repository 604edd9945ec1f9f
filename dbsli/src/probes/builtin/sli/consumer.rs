use std::{sync::Arc, thread, time::Duration};

use dbsli_common::SliEvent;
use log::{error, info, warn};

use super::pipeline::{AlertSink, MetricsSink, SliEventHandler};
use crate::error::ProbeError;
use crate::probes::{PerfChannel, ProbeState, poll_channels};
use crate::telemetry;

/// Drains `PGSLI_OUTPUT` into an [`SliEventHandler`] on its own thread.
///
/// The poll timeout equals the reconciliation period, so the shutdown flag is
/// observed at least once per period without any other wakeup.
pub struct SliConsumer<M, A> {
    channel: PerfChannel,
    handler: SliEventHandler<M, A>,
    state: Arc<ProbeState>,
    period: Duration,
}

impl<M, A> SliConsumer<M, A>
where
    M: MetricsSink + Send + 'static,
    A: AlertSink + Send + 'static,
{
    pub fn new(
        channel: PerfChannel,
        handler: SliEventHandler<M, A>,
        state: Arc<ProbeState>,
        period: Duration,
    ) -> Self {
        Self {
            channel,
            handler,
            state,
            period,
        }
    }

    /// Whatever ends the loop also ends the agent.
    pub fn spawn(self) -> Result<thread::JoinHandle<()>, ProbeError> {
        thread::Builder::new()
            .name("dbsli-sli-events".into())
            .spawn(move || {
                let state = self.state.clone();
                if let Err(e) = self.run() {
                    error!("{}", e);
                }
                state.request_shutdown();
            })
            .map_err(|e| ProbeError::Channel {
                name: "PGSLI_OUTPUT",
                reason: e.to_string(),
            })
    }

    fn run(mut self) -> Result<(), ProbeError> {
        info!("SLI event consumer running");
        while !self.state.is_shutdown() {
            if poll_channels(&[&self.channel], self.period)? == 0 {
                continue;
            }
            let handler = &mut self.handler;
            let stats = self.channel.drain::<SliEvent>(|event| {
                handler.handle(&event);
            })?;
            if stats.lost > 0 {
                warn!("Lost {} SLI events", stats.lost);
                telemetry::record_lost_events(self.channel.name(), stats.lost);
            }
        }
        Ok(())
    }
}
