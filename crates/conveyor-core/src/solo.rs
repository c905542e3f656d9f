//! Solo task: a task with a private single-line conveyor

use crate::command::{Command, Stage};
use crate::conveyor::Conveyor;
use crate::task::{Context, Event, Events, Job, TaskHandle};
use crate::Result;
use std::borrow::Cow;

/// Runs one job on its own conveyor, shut down when the job finishes
pub struct SoloTask;

impl SoloTask {
    /// Start `job` on a new solo conveyor named `name`
    pub fn spawn<J: Job>(name: impl Into<String>, job: J) -> Result<(Conveyor, TaskHandle)> {
        let conveyor = Conveyor::solo(name);
        let task = conveyor.task(SoloJob { job })?;
        task.subscribe(Events::FINISH);
        task.start();
        Ok((conveyor, task))
    }
}

struct SoloJob<J> {
    job: J,
}

impl<J: Job> Job for SoloJob<J> {
    fn work(&mut self, cx: &mut Context<'_>, stage: Stage) -> anyhow::Result<Command> {
        self.job.work(cx, stage)
    }

    fn error(&mut self, cx: &mut Context<'_>, error: &anyhow::Error, nested: bool) -> anyhow::Result<Command> {
        self.job.error(cx, error, nested)
    }

    fn event(&mut self, cx: &mut Context<'_>, event: Event) -> anyhow::Result<()> {
        let result = self.job.event(cx, event);
        if event == Event::Finish {
            cx.conveyor().shutdown();
        }
        result
    }

    fn name(&self) -> Cow<'static, str> {
        self.job.name()
    }

    fn stage_name(&self, stage: Stage) -> Option<Cow<'static, str>> {
        self.job.stage_name(stage)
    }
}
