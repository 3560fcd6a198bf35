//! Live telemetry view.
//!
//! A periodic task that snapshots the shared [`Telemetry`], ranks domains by
//! hit count and hands the ranking to a [`Renderer`]. Terminal input arrives
//! as [`ViewEvent`]s merged with the refresh timer. The loop shares nothing
//! with the DNS server except the telemetry, so quitting the view never
//! touches query handling.

pub mod table;

use std::io;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::hits::{RankedRow, Telemetry};

/// Refresh interval of the live view.
pub const DEFAULT_REFRESH: Duration = Duration::from_millis(300);

/// Input the view reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewEvent {
    /// Refresh timer fired.
    Tick,
    Key(KeyInput),
    Resize { width: u16, height: u16 },
    /// The surface asked the view to close.
    Quit,
}

/// Keys the view understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyInput {
    Quit,
    ToggleFocus,
    Up,
    Down,
    Other,
}

/// Interaction state carried between frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewState {
    pub focused: bool,
    pub selected: Option<usize>,
    pub size: Option<(u16, u16)>,
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            focused: true,
            selected: None,
            size: None,
        }
    }
}

impl ViewState {
    fn select_next(&mut self, len: usize) {
        if !self.focused || len == 0 {
            return;
        }
        self.selected = Some(match self.selected {
            Some(i) => (i + 1).min(len - 1),
            None => 0,
        });
    }

    fn select_previous(&mut self, len: usize) {
        if !self.focused || len == 0 {
            return;
        }
        self.selected = Some(self.selected.map_or(0, |i| i.saturating_sub(1)));
    }

    /// Keep the selection inside a table of `len` rows.
    fn clamp(&mut self, len: usize) {
        self.selected = match self.selected {
            _ if len == 0 => None,
            Some(i) => Some(i.min(len - 1)),
            None => None,
        };
    }
}

/// Presentation surface for the ranking.
pub trait Renderer {
    fn render(&mut self, rows: &[RankedRow], state: &ViewState) -> io::Result<()>;
}

/// Stops a running [`ViewLoop`]. Dropping the handle stops it as well.
#[derive(Debug)]
pub struct ViewHandle {
    cancel: oneshot::Sender<()>,
}

impl ViewHandle {
    pub fn cancel(self) {
        let _ = self.cancel.send(());
    }
}

/// The periodic snapshot-and-render task.
pub struct ViewLoop<R> {
    telemetry: Arc<Telemetry>,
    renderer: R,
    refresh: Duration,
    cancel: oneshot::Receiver<()>,
    state: ViewState,
    rows: Vec<RankedRow>,
}

impl<R: Renderer> ViewLoop<R> {
    pub fn new(telemetry: Arc<Telemetry>, renderer: R, refresh: Duration) -> (Self, ViewHandle) {
        let (tx, rx) = oneshot::channel();
        let view = Self {
            telemetry,
            renderer,
            refresh,
            cancel: rx,
            state: ViewState::default(),
            rows: Vec::new(),
        };

        (view, ViewHandle { cancel: tx })
    }

    /// Run until a quit event, cancellation, or the end of `events`.
    ///
    /// Returns the renderer so the caller can tear its surface down.
    pub async fn run<S>(mut self, events: S) -> io::Result<R>
    where
        S: Stream<Item = ViewEvent>,
    {
        let mut events = std::pin::pin!(events);
        let mut interval = tokio::time::interval(self.refresh);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let event = tokio::select! {
                biased;
                _ = &mut self.cancel => break,
                _ = interval.tick() => ViewEvent::Tick,
                event = events.next() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            if self.handle(event)?.is_break() {
                break;
            }
        }

        debug!("view loop stopped");
        Ok(self.renderer)
    }

    fn handle(&mut self, event: ViewEvent) -> io::Result<ControlFlow<()>> {
        match event {
            ViewEvent::Tick => {
                self.rows = self.telemetry.ranked_snapshot();
                self.state.clamp(self.rows.len());
            }
            ViewEvent::Quit | ViewEvent::Key(KeyInput::Quit) => return Ok(ControlFlow::Break(())),
            ViewEvent::Key(KeyInput::ToggleFocus) => self.state.focused = !self.state.focused,
            ViewEvent::Key(KeyInput::Up) => self.state.select_previous(self.rows.len()),
            ViewEvent::Key(KeyInput::Down) => self.state.select_next(self.rows.len()),
            ViewEvent::Key(KeyInput::Other) => return Ok(ControlFlow::Continue(())),
            ViewEvent::Resize { width, height } => self.state.size = Some((width, height)),
        }

        self.renderer.render(&self.rows, &self.state)?;
        Ok(ControlFlow::Continue(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc;

    #[derive(Default)]
    struct Recorder {
        frames: Vec<(Vec<RankedRow>, ViewState)>,
    }

    impl Renderer for Recorder {
        fn render(&mut self, rows: &[RankedRow], state: &ViewState) -> io::Result<()> {
            self.frames.push((rows.to_vec(), state.clone()));
            Ok(())
        }
    }

    fn row(domain: &str, hits: u64, flagged: bool) -> RankedRow {
        RankedRow {
            domain: domain.to_string(),
            hits,
            flagged,
        }
    }

    #[test]
    fn selection_moves_only_when_focused() {
        let mut state = ViewState::default();

        state.select_next(3);
        state.select_next(3);
        state.select_next(3);
        state.select_next(3);
        assert_eq!(state.selected, Some(2));

        state.select_previous(3);
        assert_eq!(state.selected, Some(1));

        state.focused = false;
        state.select_next(3);
        assert_eq!(state.selected, Some(1));

        state.clamp(0);
        assert_eq!(state.selected, None);
    }

    #[tokio::test]
    async fn ticks_render_ranked_snapshot_until_quit() {
        let telemetry = Arc::new(Telemetry::new());
        telemetry.record("example.com.", false);
        telemetry.record("malware.example.", true);
        telemetry.record("malware.example.", true);

        let (view, _handle) =
            ViewLoop::new(telemetry.clone(), Recorder::default(), Duration::from_millis(10));
        let (tx, rx) = mpsc::unbounded();
        let task = tokio::spawn(view.run(rx));

        tokio::time::sleep(Duration::from_millis(60)).await;
        tx.unbounded_send(ViewEvent::Key(KeyInput::Quit)).unwrap();
        let recorder = task.await.unwrap().unwrap();

        let (rows, _) = recorder.frames.last().unwrap();
        assert!(recorder.frames.len() >= 2);
        assert_eq!(
            rows,
            &vec![
                row("malware.example.", 2, true),
                row("example.com.", 1, false),
            ]
        );

        // The telemetry outlives the view and keeps counting.
        telemetry.record("example.com.", false);
        assert_eq!(telemetry.hits.get("example.com."), 2);
    }

    #[tokio::test]
    async fn keys_update_view_state() {
        let telemetry = Arc::new(Telemetry::new());
        telemetry.record("a.example.", false);
        telemetry.record("b.example.", false);

        let (view, _handle) =
            ViewLoop::new(telemetry, Recorder::default(), Duration::from_secs(3600));
        let events = futures::stream::iter(vec![
            ViewEvent::Key(KeyInput::Down),
            ViewEvent::Key(KeyInput::Down),
            ViewEvent::Key(KeyInput::ToggleFocus),
            ViewEvent::Resize {
                width: 100,
                height: 40,
            },
            ViewEvent::Quit,
        ]);

        let recorder = view.run(events).await.unwrap();
        let (_, state) = recorder.frames.last().unwrap();

        assert_eq!(state.selected, Some(1));
        assert!(!state.focused);
        assert_eq!(state.size, Some((100, 40)));
    }

    #[tokio::test]
    async fn cancel_handle_stops_the_loop() {
        let (view, handle) = ViewLoop::new(
            Arc::new(Telemetry::new()),
            Recorder::default(),
            Duration::from_millis(10),
        );
        let task = tokio::spawn(view.run(futures::stream::pending()));

        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.cancel();

        let recorder = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!recorder.frames.is_empty());
    }

    #[tokio::test]
    async fn closed_event_stream_stops_the_loop() {
        let (view, _handle) = ViewLoop::new(
            Arc::new(Telemetry::new()),
            Recorder::default(),
            Duration::from_secs(3600),
        );

        let recorder = view.run(futures::stream::empty()).await.unwrap();

        assert!(recorder.frames.len() <= 1);
    }
}
