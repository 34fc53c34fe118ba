//! UI-context hand-off.
//!
//! The capture context hands finished images to the UI context through a `UiDispatcher`.
//! The hand-off is fire-and-forget into a single-slot queue: an image the UI has not
//! drawn yet is replaced by the newer one, so the display is never more than one frame
//! behind. Only the thread that owns the `UiContext` ever calls `PresentationSink::present`.

use std::time::{Duration, Instant};

use crate::frame::BitmapImage;
use crate::latest::{latest, LatestReceiver, LatestSender, Wait};

/// Display surface. Must only be driven from the UI context.
pub trait PresentationSink {
    fn present(&mut self, image: BitmapImage);
}

impl<F> PresentationSink for F
where
    F: FnMut(BitmapImage),
{
    fn present(&mut self, image: BitmapImage) {
        self(image)
    }
}

/// Create a UI context around `sink` and the dispatcher that feeds it.
pub fn ui_context<P: PresentationSink>(sink: P) -> (UiContext<P>, UiDispatcher) {
    let (tx, rx) = latest();
    (
        UiContext {
            sink,
            rx,
            presented: 0,
        },
        UiDispatcher { tx },
    )
}

/// Capture-side handle for scheduling presentation.
pub struct UiDispatcher {
    tx: LatestSender<BitmapImage>,
}

impl UiDispatcher {
    /// Schedule `image` for presentation. Returns false once the UI context is gone.
    pub fn dispatch(&self, image: BitmapImage) -> bool {
        match self.tx.send(image) {
            Ok(None) => true,
            Ok(Some(_undrawn)) => {
                log::debug!("UiDispatcher: replaced an undrawn frame");
                true
            }
            Err(_) => false,
        }
    }
}

/// UI-side queue owner. Runs presentation on whichever thread drives it.
pub struct UiContext<P: PresentationSink> {
    sink: P,
    rx: LatestReceiver<BitmapImage>,
    presented: u64,
}

impl<P: PresentationSink> UiContext<P> {
    pub fn sink(&self) -> &P {
        &self.sink
    }

    pub fn into_sink(self) -> P {
        self.sink
    }

    /// Images presented so far.
    pub fn presented(&self) -> u64 {
        self.presented
    }

    /// Present the pending image, if any, without waiting.
    pub fn run_pending(&mut self) -> usize {
        match self.rx.try_recv() {
            Ok(image) => {
                self.present(image);
                1
            }
            Err(_) => 0,
        }
    }

    /// Present images as they arrive for `duration`.
    pub fn run_for(&mut self, duration: Duration) -> usize {
        let deadline = Instant::now() + duration;
        let mut count = 0;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return count;
            }
            match self.rx.recv_timeout(remaining) {
                Ok(image) => {
                    self.present(image);
                    count += 1;
                }
                Err(Wait::Timeout) => return count,
                Err(Wait::Disconnected) => {
                    std::thread::sleep(remaining);
                    return count;
                }
            }
        }
    }

    /// Present images until `done` holds for the sink or `timeout` elapses.
    /// Returns whether `done` was satisfied.
    pub fn run_until(&mut self, timeout: Duration, mut done: impl FnMut(&P) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while !done(&self.sink) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match self.rx.recv_timeout(remaining) {
                Ok(image) => self.present(image),
                Err(_) => return done(&self.sink),
            }
        }
        true
    }

    fn present(&mut self, image: BitmapImage) {
        self.sink.present(image);
        self.presented += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[derive(Default)]
    struct Recorder {
        frames: Vec<BitmapImage>,
    }

    impl PresentationSink for Recorder {
        fn present(&mut self, image: BitmapImage) {
            self.frames.push(image);
        }
    }

    fn grey(level: u8) -> BitmapImage {
        BitmapImage::filled(2, 2, Rgba([level, level, level, 255]))
    }

    #[test]
    fn undrawn_image_is_replaced_by_newer_one() {
        let (mut ui, dispatcher) = ui_context(Recorder::default());
        assert!(dispatcher.dispatch(grey(1)));
        assert!(dispatcher.dispatch(grey(2)));
        assert_eq!(ui.run_pending(), 1);
        assert_eq!(ui.run_pending(), 0);
        assert_eq!(ui.presented(), 1);
        let frames = ui.into_sink().frames;
        assert_eq!(frames, vec![grey(2)]);
    }

    #[test]
    fn dispatch_fails_after_ui_context_is_gone() {
        let (ui, dispatcher) = ui_context(Recorder::default());
        drop(ui);
        assert!(!dispatcher.dispatch(grey(3)));
    }

    #[test]
    fn presentation_happens_on_the_ui_thread() {
        let ui_thread = std::thread::current().id();
        let mut seen_on = Vec::new();
        let (mut ui, dispatcher) = ui_context(|_image: BitmapImage| {
            seen_on.push(std::thread::current().id());
        });
        let producer = std::thread::spawn(move || dispatcher.dispatch(grey(4)));
        assert!(producer.join().unwrap_or(false));
        ui.run_for(Duration::from_millis(50));
        drop(ui);
        assert_eq!(seen_on, vec![ui_thread]);
    }

    #[test]
    fn run_until_stops_when_condition_holds() {
        let (mut ui, dispatcher) = ui_context(Recorder::default());
        dispatcher.dispatch(grey(5));
        assert!(ui.run_until(Duration::from_secs(1), |sink| !sink.frames.is_empty()));
        assert!(!ui.run_until(Duration::from_millis(20), |sink| sink.frames.len() > 1));
    }
}
