use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct StageTiming {
    pub name: String,
    pub duration: Duration,
}

#[derive(Debug, Default)]
pub struct StageTimings {
    stages: Vec<StageTiming>,
}

impl StageTimings {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    pub fn add_stage(&mut self, name: impl Into<String>, duration: Duration) {
        self.stages.push(StageTiming {
            name: name.into(),
            duration,
        });
    }

    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    pub fn stages(&self) -> &[StageTiming] {
        &self.stages
    }
}

pub struct Timer {
    start: Instant,
    name: String,
}

impl Timer {
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    pub fn stop(self) -> (String, Duration) {
        (self.name, self.start.elapsed())
    }
}
