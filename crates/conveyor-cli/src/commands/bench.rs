//! `conveyor bench`: Normal-distribution workload.
//!
//! Every unit sleeps a random time between stages a fixed number of times,
//! then reports how late its timers fired to an observer running on its own
//! solo conveyor. The observer prints scheduler statistics every second and
//! shuts every conveyor down once all units reported.

use anyhow::bail;
use conveyor_core::{
    join_shutdown, shutdown_all, Command, Context, Conveyor, ConveyorConfig, Job, SoloTask, Stage, TaskHandle,
};
use rand::Rng;
use std::borrow::Cow;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub struct BenchArgs {
    pub tasks: usize,
    pub lines: Option<usize>,
    pub stages: usize,
    pub min_ms: u64,
    pub max_ms: u64,
    pub config: Option<PathBuf>,
    pub timeout: u64,
}

pub fn execute(args: BenchArgs) -> anyhow::Result<()> {
    if args.min_ms > args.max_ms {
        bail!("--min-ms {} is greater than --max-ms {}", args.min_ms, args.max_ms);
    }
    let mut config = match &args.config {
        Some(path) => ConveyorConfig::load(path)?,
        None => ConveyorConfig {
            name: "bench".to_string(),
            ..ConveyorConfig::default()
        },
    };
    if let Some(lines) = args.lines {
        config.lines = lines;
    }
    let conveyor = Conveyor::from_config(&config)?;
    info!(
        conveyor = conveyor.name(),
        lines = conveyor.capacity(),
        tasks = args.tasks,
        stages = args.stages,
        "starting workload"
    );

    let started = Instant::now();
    let (_observer_conveyor, observer) = SoloTask::spawn(
        "observer",
        Observer {
            conveyor: conveyor.clone(),
            expected: args.tasks,
            reported: 0,
            late_total: 0,
            late_max: 0,
            started,
        },
    )?;

    for id in 0..args.tasks {
        conveyor.spawn(Unit {
            id,
            stages: args.stages,
            done: 0,
            min_ms: args.min_ms,
            max_ms: args.max_ms,
            wake: None,
            late: 0,
            observer: observer.clone(),
        })?;
    }
    if args.tasks == 0 {
        shutdown_all();
    }

    let budget = Duration::from_millis(args.max_ms * args.stages as u64) + Duration::from_secs(args.timeout);
    if join_shutdown(budget) {
        println!("Workload finished in {:.1}s", started.elapsed().as_secs_f64());
        Ok(())
    } else {
        println!("{}", conveyor.stats());
        bail!("conveyors did not stop within {}s", budget.as_secs())
    }
}

/// Final report of one unit
struct Report {
    id: usize,
    late: u64,
}

struct Unit {
    id: usize,
    stages: usize,
    done: usize,
    min_ms: u64,
    max_ms: u64,
    /// When the pending delay should fire
    wake: Option<Instant>,
    /// Milliseconds the timers fired late in total
    late: u64,
    observer: TaskHandle,
}

impl Job for Unit {
    fn work(&mut self, cx: &mut Context<'_>, stage: Stage) -> anyhow::Result<Command> {
        if stage != Stage::START && stage != Stage::TIMER {
            return Ok(Command::Unknown);
        }
        if let Some(wake) = self.wake.take() {
            self.late += Instant::now().saturating_duration_since(wake).as_millis() as u64;
            self.done += 1;
        }
        if self.done >= self.stages {
            self.observer.signal(
                Report {
                    id: self.id,
                    late: self.late,
                },
                Stage::SIGNAL,
            );
            return Ok(Command::Finish);
        }
        let pause = Duration::from_millis(rand::thread_rng().gen_range(self.min_ms..=self.max_ms));
        self.wake = Some(Instant::now() + pause);
        cx.delay(pause, Stage::TIMER);
        Ok(Command::Default)
    }

    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed("unit")
    }
}

struct Observer {
    conveyor: Conveyor,
    expected: usize,
    reported: usize,
    late_total: u64,
    late_max: u64,
    started: Instant,
}

impl Observer {
    const OVERVIEW: Stage = Stage::new(1);
}

impl Job for Observer {
    fn work(&mut self, cx: &mut Context<'_>, stage: Stage) -> anyhow::Result<Command> {
        match stage {
            Stage::START => {
                cx.regular(Duration::from_secs(1), Stage::TIMER);
                Ok(Command::Default)
            }
            Stage::SIGNAL => {
                let Some(report) = cx.take_target::<Report>() else {
                    warn!("observer received a signal without a report");
                    return Ok(Command::Default);
                };
                self.reported += 1;
                self.late_total += report.late;
                if report.late > self.late_max {
                    self.late_max = report.late;
                }
                if report.id == 0 {
                    info!(late_ms = report.late, "unit 0 finished");
                }
                if self.reported == self.expected {
                    return Ok(Command::Goto(Self::OVERVIEW));
                }
                Ok(Command::Default)
            }
            Stage::TIMER => {
                println!("{} | reported {}/{}", self.conveyor.stats(), self.reported, self.expected);
                Ok(if self.reported >= self.expected {
                    Command::Cancel
                } else {
                    Command::Default
                })
            }
            Self::OVERVIEW => {
                let mean = self.late_total / self.reported.max(1) as u64;
                println!(
                    "All {} units finished after {:.1}s; timer lateness mean {}ms, max {}ms",
                    self.reported,
                    self.started.elapsed().as_secs_f64(),
                    mean,
                    self.late_max
                );
                shutdown_all();
                Ok(Command::Finish)
            }
            _ => Ok(Command::Unknown),
        }
    }

    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed("observer")
    }

    fn stage_name(&self, stage: Stage) -> Option<Cow<'static, str>> {
        (stage == Self::OVERVIEW).then_some(Cow::Borrowed("overview"))
    }
}
