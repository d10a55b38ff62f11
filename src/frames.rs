//! Frame lists, the usual way of describing a sweep of contexts.
//!
//! The syntax is a comma separated list of items, where each item is either a
//! single frame (`7`), an inclusive range (`1-10`), or a stepped range
//! (`1-10x3`). Ranges whose end is below their start run backwards. A list
//! holds at most [`MAX_FRAMES`] frames.
//!
//! ```rust
//! use taskdispatch::FrameList;
//!
//! let frames: FrameList = "1-5x2, 10, 13-12".parse().unwrap();
//! assert_eq!(frames.frames(), &[1, 3, 5, 10, 13, 12]);
//! ```

use std::str::FromStr;

use crate::context::ExecutionContext;
use crate::error::FrameListError;

/// Most frames a parsed list may hold.
pub const MAX_FRAMES: usize = 1_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FrameList {
    frames: Vec<i64>,
}

impl FrameList {
    pub fn new(frames: impl IntoIterator<Item = i64>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
        }
    }

    pub fn frames(&self) -> &[i64] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// One context per frame, each a copy of `base` with the frame replaced.
    pub fn contexts(&self, base: &ExecutionContext) -> Vec<ExecutionContext> {
        self.frames
            .iter()
            .map(|&frame| base.clone().with_frame(frame))
            .collect()
    }
}

fn parse_frame(text: &str) -> Result<i64, FrameListError> {
    text.trim()
        .parse()
        .map_err(|_| FrameListError::Frame(text.trim().to_string()))
}

fn parse_item(item: &str, out: &mut Vec<i64>) -> Result<(), FrameListError> {
    let (range, step) = match item.split_once('x') {
        Some((range, step)) => {
            let step: i64 = step
                .trim()
                .parse()
                .map_err(|_| FrameListError::Step(item.to_string()))?;
            if step <= 0 {
                return Err(FrameListError::Step(item.to_string()));
            }
            (range, step)
        }
        None => (item, 1),
    };

    // A leading '-' belongs to the first number, not to the range.
    let split = range
        .char_indices()
        .skip(1)
        .find(|&(_, c)| c == '-')
        .map(|(i, _)| i);

    let room = MAX_FRAMES.saturating_sub(out.len()) as u64;

    match split {
        None => {
            if step != 1 {
                return Err(FrameListError::Step(item.to_string()));
            }
            if room == 0 {
                return Err(FrameListError::TooLong { limit: MAX_FRAMES });
            }
            out.push(parse_frame(range)?);
        }
        Some(i) => {
            let start = parse_frame(&range[..i])?;
            let end = parse_frame(&range[i + 1..])?;

            if start.abs_diff(end) / step.unsigned_abs() + 1 > room {
                return Err(FrameListError::TooLong { limit: MAX_FRAMES });
            }

            let forward = start <= end;
            let mut frame = Some(start);
            while let Some(current) = frame.filter(|&f| if forward { f <= end } else { f >= end }) {
                out.push(current);
                // Stepping past either end of the integer range ends the range too.
                frame = if forward {
                    current.checked_add(step)
                } else {
                    current.checked_sub(step)
                };
            }
        }
    }

    Ok(())
}

impl FromStr for FrameList {
    type Err = FrameListError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut frames = Vec::new();

        for item in s.split(',').map(str::trim).filter(|item| !item.is_empty()) {
            parse_item(item, &mut frames)?;
        }

        if frames.is_empty() {
            return Err(FrameListError::Empty);
        }

        Ok(Self { frames })
    }
}
