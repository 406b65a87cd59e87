// Copyright (c) 2023 Yan Ka, Chiu.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
// 1. Redistributions of source code must retain the above copyright
//    notice, this list of conditions, and the following disclaimer,
//    without modification, immediately at the beginning of the file.
// 2. The name of the author may not be used to endorse or promote products
//    derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE AUTHOR AND CONTRIBUTORS ``AS IS'' AND
// ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE
// IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE
// ARE DISCLAIMED. IN NO EVENT SHALL THE AUTHOR OR CONTRIBUTORS BE LIABLE FOR
// ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL, EXEMPLARY, OR CONSEQUENTIAL
// DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS
// OR SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION)
// HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT
// LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY
// OUT OF THE USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF
// SUCH DAMAGE.

use crate::notify::SupervisorNotify;
use tokio::sync::watch;
use tracing::debug;

/// Phases of a pull, in execution order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Searching,
    Resolving,
    Metadata,
    Downloading,
    Copying,
}

/// Per-job completion snapshot feeding the combined percent
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct JobPercents {
    pub images: u32,
    pub tags: u32,
    pub ancestry: u32,
    pub json: u32,
    pub layer: u32,
    pub cursor: usize,
    pub n_ancestry: usize,
}

/// Weight the per-phase job percents into one 0..=95 figure: 5% each for the index and
/// tag lookups, 10% for the metadata pair, 75% spread evenly over the layer downloads,
/// and a flat 95% once copying starts.
pub(crate) fn combined_percent(phase: Phase, jobs: &JobPercents) -> u32 {
    match phase {
        Phase::Searching => jobs.images * 5 / 100,
        Phase::Resolving => 5 + jobs.tags * 5 / 100,
        Phase::Metadata => 10 + jobs.ancestry * 5 / 100 + jobs.json * 5 / 100,
        Phase::Downloading => {
            let n = jobs.n_ancestry.max(1) as u32;
            20 + 75 * jobs.cursor as u32 / n + jobs.layer * 75 / n / 100
        }
        Phase::Copying => 95,
    }
}

/// Publishes the combined percent on every state change, to the session's watch channel
/// and, best-effort, to the supervising process.
pub(crate) struct Reporter {
    tx: watch::Sender<u32>,
    notify: Option<SupervisorNotify>,
    phase: Phase,
    jobs: JobPercents,
    last: u32,
}

impl Reporter {
    pub fn new(tx: watch::Sender<u32>, notify: Option<SupervisorNotify>) -> Reporter {
        Reporter {
            tx,
            notify,
            phase: Phase::Searching,
            jobs: JobPercents::default(),
            last: 0,
        }
    }

    pub fn enter(&mut self, phase: Phase) {
        self.phase = phase;
        self.publish();
    }

    pub fn update(&mut self, f: impl FnOnce(&mut JobPercents)) {
        f(&mut self.jobs);
        self.publish();
    }

    fn publish(&mut self) {
        let percent = combined_percent(self.phase, &self.jobs).max(self.last);
        self.last = percent;
        self.tx.send_replace(percent);
        if let Some(notify) = &self.notify {
            notify.progress(percent);
        }
        debug!("combined progress {percent}%");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_base_percentages() {
        let jobs = JobPercents::default();
        assert_eq!(combined_percent(Phase::Searching, &jobs), 0);
        assert_eq!(combined_percent(Phase::Resolving, &jobs), 5);
        assert_eq!(combined_percent(Phase::Metadata, &jobs), 10);
        assert_eq!(
            combined_percent(
                Phase::Downloading,
                &JobPercents {
                    n_ancestry: 2,
                    ..jobs
                }
            ),
            20
        );
        assert_eq!(combined_percent(Phase::Copying, &jobs), 95);
    }

    #[test]
    fn test_download_progress_spreads_over_layers() {
        let jobs = JobPercents {
            n_ancestry: 2,
            cursor: 1,
            layer: 50,
            ..JobPercents::default()
        };
        // 20 + 75/2 + 50*75/2/100
        assert_eq!(combined_percent(Phase::Downloading, &jobs), 75);
    }

    #[test]
    fn test_download_with_empty_chain_does_not_divide_by_zero() {
        let jobs = JobPercents::default();
        assert_eq!(combined_percent(Phase::Downloading, &jobs), 20);
    }

    #[test]
    fn test_full_run_is_weakly_monotonic_and_ends_past_95() {
        let (tx, rx) = watch::channel(0);
        let mut reporter = Reporter::new(tx, None);
        let mut observed = vec![*rx.borrow()];
        let mut step = |reporter: &mut Reporter, f: &dyn Fn(&mut Reporter)| {
            f(reporter);
            observed.push(*rx.borrow());
        };

        step(&mut reporter, &|r| r.enter(Phase::Searching));
        step(&mut reporter, &|r| r.update(|j| j.images = 100));
        step(&mut reporter, &|r| r.enter(Phase::Resolving));
        step(&mut reporter, &|r| r.update(|j| j.tags = 100));
        step(&mut reporter, &|r| r.enter(Phase::Metadata));
        step(&mut reporter, &|r| r.update(|j| j.json = 100));
        step(&mut reporter, &|r| r.update(|j| j.ancestry = 100));
        step(&mut reporter, &|r| {
            r.update(|j| j.n_ancestry = 3);
            r.enter(Phase::Downloading)
        });
        for cursor in 0..3 {
            step(&mut reporter, &move |r| {
                r.update(|j| {
                    j.cursor = cursor;
                    j.layer = 0
                })
            });
            step(&mut reporter, &|r| r.update(|j| j.layer = 100));
        }
        step(&mut reporter, &|r| r.enter(Phase::Copying));

        assert!(observed.windows(2).all(|w| w[0] <= w[1]));
        assert!(*observed.last().unwrap() >= 95);
    }
}
