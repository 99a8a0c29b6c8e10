//! Iteration planning.
//!
//! A run visits every `(pass, page_offset)` pair in
//! `[0, repeat) x [0, pages)` exactly once, with page offsets cycling faster
//! than passes. [`RunCursor`] walks that grid as two nested ranges and carries
//! its own position, so no global counter is involved.

use serde::Serialize;

use crate::config::RunConfig;

/// Number of requests a run issues: `pages * repeat`.
pub fn total_iterations(config: &RunConfig) -> u64 {
    u64::from(config.pages) * u64::from(config.repeat)
}

/// Page requested by the zero-based `iteration`, or `None` past the end of the run.
pub fn next_page(iteration: u64, config: &RunConfig) -> Option<u64> {
    IterationIndex::locate(iteration, config).map(|index| index.page)
}

/// Position of one iteration within the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct IterationIndex {
    pub iteration: u64,
    pub pass: u32,
    pub page_offset: u32,
    pub page: u64,
}

impl IterationIndex {
    pub fn locate(iteration: u64, config: &RunConfig) -> Option<Self> {
        if config.pages == 0 || iteration >= total_iterations(config) {
            return None;
        }
        let pages = u64::from(config.pages);
        let pass = u32::try_from(iteration / pages).ok()?;
        let page_offset = u32::try_from(iteration % pages).ok()?;
        Some(Self {
            iteration,
            pass,
            page_offset,
            page: u64::from(config.start_page) + u64::from(page_offset),
        })
    }
}

/// Explicit run state: which pass and page offset come next.
#[derive(Debug, Clone)]
pub struct RunCursor {
    pages: u32,
    repeat: u32,
    start_page: u32,
    pass: u32,
    page_offset: u32,
    iteration: u64,
}

impl RunCursor {
    pub fn new(config: &RunConfig) -> Self {
        Self {
            pages: config.pages,
            repeat: config.repeat,
            start_page: config.start_page,
            pass: 0,
            page_offset: 0,
            iteration: 0,
        }
    }

    /// Iterations already handed out.
    pub fn position(&self) -> u64 {
        self.iteration
    }

    fn remaining(&self) -> u64 {
        (u64::from(self.pages) * u64::from(self.repeat)).saturating_sub(self.iteration)
    }
}

impl Iterator for RunCursor {
    type Item = IterationIndex;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pages == 0 || self.pass >= self.repeat {
            return None;
        }

        let index = IterationIndex {
            iteration: self.iteration,
            pass: self.pass,
            page_offset: self.page_offset,
            page: u64::from(self.start_page) + u64::from(self.page_offset),
        };

        self.iteration += 1;
        self.page_offset += 1;
        if self.page_offset == self.pages {
            self.page_offset = 0;
            self.pass += 1;
        }

        Some(index)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match usize::try_from(self.remaining()) {
            Ok(remaining) => (remaining, Some(remaining)),
            Err(_) => (usize::MAX, None),
        }
    }
}

impl std::iter::FusedIterator for RunCursor {}
