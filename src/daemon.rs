//! Wires the kernel watches, the gate and the state machine together.

use std::time::Instant;

use anyhow::Context;
use smol::channel::{Receiver, Sender};

use crate::config::Config;
use crate::dbus::DbusActuator;
use crate::level::Level;
use crate::meminfo;
use crate::monitor::{Actuator, Monitor};
use crate::psi::{PsiError, PsiTrigger, StallType};

/// PSI observation window shared by every level.
const WINDOW_US: u32 = 1_000_000;

/// Stall type and threshold within the window, per severity level.
const TRIGGERS: [(Level, StallType, u32); 3] = [
    (Level::Low, StallType::Some, 70_000),       // 70ms of partial stall
    (Level::Medium, StallType::Some, 100_000),   // 100ms of partial stall
    (Level::Critical, StallType::Full, 100_000), // 100ms of complete stall
];

enum Event {
    Fired(Level),
    Dead(Level, PsiError),
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let actuator = match DbusActuator::connect().await {
        Err(zbus::Error::NameTaken) => {
            log::warn!("low-memory-monitor is already running, exiting");
            return Ok(());
        }
        other => other.context("could not connect to the system bus")?,
    };

    let (tx, rx) = smol::channel::unbounded();
    let mut watches = 0;
    for (level, stall, threshold_us) in TRIGGERS {
        match PsiTrigger::register(level, stall, threshold_us, WINDOW_US) {
            Ok(trigger) => {
                smolscale::spawn(watch(trigger, tx.clone())).detach();
                watches += 1;
            }
            Err(e) => log::warn!(
                "failed to add memory pressure monitor for {}: {}",
                level.as_str(),
                e
            ),
        }
    }
    // the loop below ends once every watch task has dropped its sender
    drop(tx);

    if watches == 0 {
        anyhow::bail!("no memory pressure trigger could be registered, nothing to monitor");
    }
    log::info!("monitoring memory pressure with {} trigger(s)", watches);

    let mut monitor = Monitor::new(actuator, config.trigger_kernel_oom);
    event_loop(&mut monitor, rx, read_gate).await;

    log::warn!("all pressure watches are gone, exiting");
    Ok(())
}

async fn watch(trigger: PsiTrigger, tx: Sender<Event>) {
    let level = trigger.level();
    loop {
        match trigger.wait().await {
            Ok(()) => {
                if tx.send(Event::Fired(level)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = tx.send(Event::Dead(level, e)).await;
                return;
            }
        }
    }
}

fn read_gate() -> Option<f64> {
    match meminfo::available_ratio() {
        Ok(ratio) => Some(ratio),
        Err(e) => {
            log::warn!("could not read available memory: {}", e);
            None
        }
    }
}

/// Runs the monitor until every watch has died. After each wakeup, every
/// event that is already queued is handled before a deferred decision is
/// re-evaluated, so a deferral settles only once the loop is otherwise idle.
async fn event_loop<A, G>(monitor: &mut Monitor<A>, rx: Receiver<Event>, gate: G)
where
    A: Actuator + Send,
    G: Fn() -> Option<f64>,
{
    loop {
        let ev = match rx.recv().await {
            Ok(ev) => ev,
            Err(_) => return,
        };
        handle_event(monitor, ev, &gate).await;
        while let Ok(ev) = rx.try_recv() {
            handle_event(monitor, ev, &gate).await;
        }
        if monitor.deferral_pending() {
            monitor.run_deferred().await;
        }
    }
}

async fn handle_event<A, G>(monitor: &mut Monitor<A>, ev: Event, gate: &G)
where
    A: Actuator + Send,
    G: Fn() -> Option<f64>,
{
    match ev {
        Event::Fired(level) => {
            monitor.handle_trigger(level, gate(), Instant::now()).await;
        }
        Event::Dead(level, err) => {
            log::warn!("dropping {} pressure watch: {}", level.as_str(), err);
        }
    }
}
