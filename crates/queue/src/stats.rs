//! Queue depth and throughput sampling

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use serde::Serialize;

use crate::persistence::{JobQueue, QueueError};

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// One statistics sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Stats {
    /// Pending plus leased jobs at the end of the interval
    pub jobs_left: usize,

    /// Jobs drained per second over the interval; negative when the queue grew
    pub performance: i64,
}

impl Stats {
    /// Derive a sample from two consecutive queue sizes
    pub fn from_sizes(previous: usize, current: usize, interval: Duration) -> Self {
        let drained = previous as f64 - current as f64;
        Self {
            jobs_left: current,
            performance: (drained / interval.as_secs_f64()).round_ties_even() as i64,
        }
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Jobs left: {}, Performance: {} jobs/sec",
            self.jobs_left, self.performance
        )
    }
}

/// Samples `size()` once per interval
pub struct StatisticsReporter {
    queue: Arc<dyn JobQueue>,
    interval: Duration,
    previous: Option<usize>,
}

impl StatisticsReporter {
    pub fn new(queue: Arc<dyn JobQueue>, interval: Duration) -> Self {
        Self {
            queue,
            interval: interval.max(MIN_INTERVAL),
            previous: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait one interval and compare the queue size against the previous sample
    ///
    /// The first call reads a baseline before waiting. Dropping the future
    /// mid-wait is safe.
    pub async fn sample(&mut self) -> Result<Stats, QueueError> {
        let previous = match self.previous {
            Some(previous) => previous,
            None => {
                let size = self.queue.size().await?;
                self.previous = Some(size);
                size
            }
        };

        tokio::time::sleep(self.interval).await;

        let current = self.queue.size().await?;
        self.previous = Some(current);
        Ok(Stats::from_sizes(previous, current, self.interval))
    }

    /// Endless stream of samples
    pub fn into_stream(self) -> impl Stream<Item = Result<Stats, QueueError>> {
        futures::stream::unfold(self, |mut reporter| async move {
            let stats = reporter.sample().await;
            Some((stats, reporter))
        })
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::persistence::{InMemoryJobQueue, Payload};

    #[test]
    fn test_line_format() {
        let stats = Stats::from_sizes(0, 0, Duration::from_secs(1));
        assert_eq!(stats.to_string(), "Jobs left: 0, Performance: 0 jobs/sec");
    }

    #[test]
    fn test_performance_rounding() {
        assert_eq!(Stats::from_sizes(10, 4, Duration::from_secs(1)).performance, 6);
        // Halves round to even
        assert_eq!(Stats::from_sizes(10, 5, Duration::from_secs(2)).performance, 2);
        assert_eq!(Stats::from_sizes(7, 0, Duration::from_secs(2)).performance, 4);
        assert_eq!(Stats::from_sizes(0, 5, Duration::from_secs(2)).performance, -2);
        assert_eq!(Stats::from_sizes(10, 9, Duration::from_secs(4)).performance, 0);
        assert_eq!(Stats::from_sizes(3, 7, Duration::from_secs(1)).performance, -4);
        assert_eq!(
            Stats::from_sizes(100, 50, Duration::from_millis(500)).performance,
            100
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sample_empty_queue() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let mut reporter = StatisticsReporter::new(queue, Duration::from_secs(1));

        let stats = reporter.sample().await.unwrap();
        assert_eq!(stats.to_string(), "Jobs left: 0, Performance: 0 jobs/sec");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_tracks_draining() {
        let queue = Arc::new(InMemoryJobQueue::new());
        for _ in 0..5 {
            queue.enqueue(Payload::new()).await.unwrap();
        }

        let reporter = StatisticsReporter::new(queue.clone(), Duration::from_secs(1));
        let mut stream = Box::pin(reporter.into_stream());

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first, Stats { jobs_left: 5, performance: 0 });

        queue.clear();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second, Stats { jobs_left: 0, performance: 5 });
    }

    #[test]
    fn test_zero_interval_is_clamped() {
        let reporter = StatisticsReporter::new(Arc::new(InMemoryJobQueue::new()), Duration::ZERO);
        assert_eq!(reporter.interval(), MIN_INTERVAL);
    }
}
