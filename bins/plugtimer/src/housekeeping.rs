use crate::module::{Module, ModuleCtx};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info};

/// Periodically fails executions that outlived their budget and drops
/// finished jobs whose retention elapsed without a purge.
pub struct Housekeeper { period: Duration }
impl Housekeeper { pub fn new(period: Duration) -> Self { Self { period } } }

impl Module for Housekeeper {
    fn name(&self) -> &'static str { "housekeeping" }
    fn spawn(self: Box<Self>, mut ctx: ModuleCtx) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            let mut tick = interval(self.period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut sweeps: u64 = 0;
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        sweeps += 1;
                        let report = ctx.service.housekeep();
                        debug!(sweeps, crashed = report.crashed, purged = report.purged, "housekeeping tick");
                    }
                    changed = ctx.shutdown.changed() => {
                        if changed.is_err() || *ctx.shutdown.borrow() {
                            info!("housekeeping stopping after {} sweeps", sweeps);
                            break;
                        }
                    }
                }
            }
            Ok(())
        })
    }
}
