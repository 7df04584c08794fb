//! Serialized tone playback.
//!
//! [`SoundWorker`] owns the buzzer and a FIFO of [`SoundTask`]s consumed by a
//! single worker thread, so cues queued from different stages never overlap.
//!
//! ```text
//! play_sequence_async ─┐
//! queue_function ──────┼─▶ crossbeam queue ─▶ "sound-worker" thread ─▶ Buzzer
//! play_tone_immediate ─┘ (direct, caller's thread) ───────────────────▶ Buzzer
//! ```
//!
//! Interruption is cooperative: tone holds are sliced (50 ms by default) and
//! the interrupt signal is checked between slices and between tones.
//! Hardware faults reinitialise the buzzer from its factory and abandon the
//! tone; nothing here ever reports an error to the pipeline.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::hardware::{Buzzer, BuzzerFactory, HardwareError};
use crate::sync::{join_bounded, lock, StopSignal};

use super::tones::Cue;

/// Silence between consecutive tones of a sequence.
const NOTE_GAP: Duration = Duration::from_millis(20);
/// How often the idle worker re-checks its running flag.
const IDLE_POLL: Duration = Duration::from_millis(500);
const SHUTDOWN_JOIN: Duration = Duration::from_secs(2);

/// A deferred unit of sound work.
pub type SoundTask = Box<dyn FnOnce(&TonePlayer) + Send>;

// ---------------------------------------------------------------------------
// TonePlayer
// ---------------------------------------------------------------------------

/// The buzzer handle plus the interrupt signal.  Handed to every task.
pub struct TonePlayer {
    buzzer: Mutex<Arc<dyn Buzzer>>,
    factory: BuzzerFactory,
    interrupt: StopSignal,
    /// Whether a queued task is running.  The interrupt is only set and
    /// cleared while this lock is held.
    active: Mutex<bool>,
    slice: Duration,
    reinits: AtomicUsize,
}

impl TonePlayer {
    fn new(factory: BuzzerFactory, slice: Duration) -> Result<Self, HardwareError> {
        let buzzer = factory()?;
        Ok(Self {
            buzzer: Mutex::new(buzzer),
            factory,
            interrupt: StopSignal::new(),
            active: Mutex::new(false),
            slice,
            reinits: AtomicUsize::new(0),
        })
    }

    fn handle(&self) -> Arc<dyn Buzzer> {
        Arc::clone(&lock(&self.buzzer))
    }

    /// Replace the buzzer handle with a freshly constructed one.
    fn reinitialize(&self) {
        match (self.factory)() {
            Ok(fresh) => {
                *lock(&self.buzzer) = fresh;
                self.reinits.fetch_add(1, Ordering::SeqCst);
                log::debug!("sound: buzzer reinitialised");
            }
            Err(e) => log::warn!("sound: buzzer reinitialisation failed: {e}"),
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_set()
    }

    fn begin_task(&self) {
        *lock(&self.active) = true;
    }

    /// Mark the running task finished and drop any interrupt aimed at it.
    fn end_task(&self) {
        let mut active = lock(&self.active);
        *active = false;
        self.interrupt.clear();
    }

    /// Interrupt the running task.  Does nothing between tasks, so the
    /// signal can never outlive the task it was meant for.
    fn interrupt_task(&self) {
        let active = lock(&self.active);
        if *active {
            self.interrupt.set();
        }
    }

    fn is_active(&self) -> bool {
        *lock(&self.active)
    }

    /// Play one tone synchronously on the caller's thread.
    ///
    /// Returns `true` if the tone was held for its full duration, `false` if
    /// it was interrupted or abandoned after a hardware fault.
    pub fn play_tone_immediate(&self, freq_hz: f32, duration: Duration) -> bool {
        let buzzer = self.handle();
        if let Err(e) = buzzer.play(freq_hz) {
            log::warn!("sound: tone {freq_hz:.0} Hz failed ({e}); reinitialising");
            self.reinitialize();
            return false;
        }

        let mut remaining = duration;
        let mut completed = true;
        while !remaining.is_zero() {
            let step = remaining.min(self.slice);
            if self.interrupt.wait_timeout(step) {
                completed = false;
                break;
            }
            remaining -= step;
        }

        if let Err(e) = buzzer.stop() {
            log::warn!("sound: stop failed ({e}); reinitialising");
            self.reinitialize();
        }
        completed
    }

    /// Play `tones` in order, stopping at the first interruption.
    pub fn play_sequence(&self, tones: &[f32], durations: &[Duration]) {
        for (freq, dur) in tones.iter().zip(durations) {
            if self.is_interrupted() {
                return;
            }
            if !self.play_tone_immediate(*freq, *dur) {
                return;
            }
            if self.interrupt.wait_timeout(NOTE_GAP) {
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// SoundWorker
// ---------------------------------------------------------------------------

/// Single-consumer sound queue.
pub struct SoundWorker {
    player: Arc<TonePlayer>,
    tx: Sender<SoundTask>,
    rx: Receiver<SoundTask>,
    running: Arc<AtomicBool>,
    force_stops: AtomicUsize,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SoundWorker {
    /// Construct the buzzer via `factory` and start the worker thread.
    pub fn start(factory: BuzzerFactory, slice: Duration) -> Result<Self, HardwareError> {
        let player = Arc::new(TonePlayer::new(factory, slice)?);
        let (tx, rx) = unbounded::<SoundTask>();
        let running = Arc::new(AtomicBool::new(true));

        let thread = {
            let player = Arc::clone(&player);
            let rx = rx.clone();
            let running = Arc::clone(&running);
            std::thread::Builder::new()
                .name("sound-worker".into())
                .spawn(move || worker_loop(&player, &rx, &running))
                .map_err(|e| HardwareError::io("sound-worker thread", e))?
        };

        log::info!("sound: worker started");
        Ok(Self {
            player,
            tx,
            rx,
            running,
            force_stops: AtomicUsize::new(0),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Queue an arbitrary sound task.
    pub fn queue_function<F>(&self, task: F)
    where
        F: FnOnce(&TonePlayer) + Send + 'static,
    {
        if self.tx.send(Box::new(task)).is_err() {
            log::debug!("sound: worker gone, dropping task");
        }
    }

    /// Queue a tone sequence.  `tones` and `durations` are paired by index.
    pub fn play_sequence_async(&self, tones: Vec<f32>, durations: Vec<Duration>) {
        self.queue_function(move |player| player.play_sequence(&tones, &durations));
    }

    pub fn play_cue(&self, cue: Cue) {
        let (tones, durations) = cue.sequence();
        self.play_sequence_async(tones, durations);
    }

    /// Play a tone synchronously on the caller's thread.
    pub fn play_tone_immediate(&self, freq_hz: f32, duration: Duration) -> bool {
        self.player.play_tone_immediate(freq_hz, duration)
    }

    /// Silence the buzzer.  Falls back to reinitialising on error.
    pub fn stop(&self) {
        if let Err(e) = self.player.handle().stop() {
            log::warn!("sound: stop failed ({e}); reinitialising");
            self.player.reinitialize();
        }
    }

    /// Abort the in-flight task, if any, and silence the buzzer.
    pub fn interrupt_current_task(&self) {
        self.player.interrupt_task();
        self.stop();
    }

    /// Interrupt the current task and drop everything queued behind it.
    ///
    /// A no-op when nothing is playing or queued.  Only when tasks were
    /// actually discarded is the more expensive [`force_stop`] run.
    /// Returns the number of discarded tasks.
    ///
    /// [`force_stop`]: SoundWorker::force_stop
    pub fn clear_queue_and_interrupt(&self) -> usize {
        if self.player.is_interrupted() {
            return 0;
        }
        if !self.is_busy() && self.rx.is_empty() {
            return 0;
        }

        self.interrupt_current_task();
        let drained = self.rx.try_iter().count();
        if drained > 0 {
            log::debug!("sound: discarded {drained} queued task(s)");
            self.force_stop();
        }
        drained
    }

    /// Stop hard: interrupt, silence, and rebuild the buzzer handle if the
    /// normal stop fails.
    pub fn force_stop(&self) {
        self.force_stops.fetch_add(1, Ordering::SeqCst);
        self.player.interrupt_task();
        if let Err(e) = self.player.handle().stop() {
            log::warn!("sound: force stop failed ({e}); rebuilding buzzer");
            self.player.reinitialize();
        }
    }

    /// Stop hard and always rebuild the buzzer handle.
    pub fn force_stop_and_reinitialize(&self) {
        self.force_stop();
        self.player.reinitialize();
    }

    pub fn is_busy(&self) -> bool {
        self.player.is_active()
    }

    pub fn queue_len(&self) -> usize {
        self.rx.len()
    }

    pub fn force_stop_count(&self) -> usize {
        self.force_stops.load(Ordering::SeqCst)
    }

    pub fn reinit_count(&self) -> usize {
        self.player.reinits.load(Ordering::SeqCst)
    }

    /// Stop the worker thread, discarding queued tasks.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.rx.try_iter().for_each(drop);
        self.interrupt_current_task();
        if let Some(thread) = lock(&self.thread).take() {
            if !join_bounded(thread, SHUTDOWN_JOIN) {
                log::warn!("sound: worker did not exit within {SHUTDOWN_JOIN:?}");
            }
        }
        log::info!("sound: worker stopped");
    }
}

impl Drop for SoundWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(player: &TonePlayer, rx: &Receiver<SoundTask>, running: &AtomicBool) {
    while running.load(Ordering::SeqCst) {
        let task = match rx.recv_timeout(IDLE_POLL) {
            Ok(task) => task,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        player.begin_task();
        if catch_unwind(AssertUnwindSafe(|| task(player))).is_err() {
            log::error!("sound: task panicked");
        }
        player.end_task();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::SimBuzzer;
    use std::time::Instant;

    fn sim_worker() -> (SoundWorker, Arc<SimBuzzer>) {
        let buzzer = Arc::new(SimBuzzer::new());
        let shared = Arc::clone(&buzzer);
        let factory: BuzzerFactory = Arc::new(move || Ok(Arc::clone(&shared) as Arc<dyn Buzzer>));
        let worker = SoundWorker::start(factory, Duration::from_millis(10)).unwrap();
        (worker, buzzer)
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn sequences_play_in_fifo_order() {
        let (worker, buzzer) = sim_worker();
        worker.play_sequence_async(vec![100.0, 200.0], vec![Duration::from_millis(5); 2]);
        worker.play_sequence_async(vec![300.0], vec![Duration::from_millis(5)]);

        assert!(wait_until(|| buzzer.played().len() == 3));
        assert_eq!(buzzer.played(), vec![100.0, 200.0, 300.0]);
    }

    #[test]
    fn clear_on_idle_worker_is_noop() {
        let (worker, _buzzer) = sim_worker();
        assert_eq!(worker.clear_queue_and_interrupt(), 0);
        assert_eq!(worker.force_stop_count(), 0);
    }

    #[test]
    fn clear_interrupts_long_tone_and_drains_queue() {
        let (worker, buzzer) = sim_worker();
        worker.play_sequence_async(vec![440.0], vec![Duration::from_secs(10)]);
        worker.play_sequence_async(vec![880.0], vec![Duration::from_millis(5)]);
        worker.play_sequence_async(vec![990.0], vec![Duration::from_millis(5)]);
        assert!(wait_until(|| worker.is_busy()));

        let start = Instant::now();
        let drained = worker.clear_queue_and_interrupt();
        assert_eq!(drained, 2);
        assert_eq!(worker.force_stop_count(), 1);

        assert!(wait_until(|| !worker.is_busy()));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(buzzer.played(), vec![440.0]);
        assert_eq!(buzzer.sounding(), None);
    }

    #[test]
    fn interrupt_only_aborts_in_flight_task() {
        let (worker, buzzer) = sim_worker();
        worker.play_sequence_async(vec![440.0], vec![Duration::from_secs(10)]);
        assert!(wait_until(|| worker.is_busy()));
        worker.interrupt_current_task();

        worker.play_sequence_async(vec![523.0], vec![Duration::from_millis(5)]);
        assert!(wait_until(|| buzzer.played().contains(&523.0)));
    }

    #[test]
    fn interrupt_between_tasks_does_not_reach_the_next_one() {
        let (worker, buzzer) = sim_worker();
        worker.play_sequence_async(vec![100.0], vec![Duration::from_millis(5)]);
        assert!(wait_until(|| buzzer.played().len() == 1 && !worker.is_busy()));

        worker.interrupt_current_task();
        worker.force_stop();
        assert!(!worker.player.is_interrupted());

        let interrupted = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&interrupted);
        worker.queue_function(move |player| *seen.lock().unwrap() = Some(player.is_interrupted()));
        assert!(wait_until(|| interrupted.lock().unwrap().is_some()));
        assert_eq!(*interrupted.lock().unwrap(), Some(false));

        // Nothing stale is left to short-circuit a later clear.
        worker.play_sequence_async(vec![440.0], vec![Duration::from_secs(10)]);
        worker.play_sequence_async(vec![880.0], vec![Duration::from_millis(5)]);
        assert!(wait_until(|| worker.is_busy()));
        assert_eq!(worker.clear_queue_and_interrupt(), 1);
    }

    #[test]
    fn force_stop_and_reinitialize_always_rebuilds() {
        let (worker, _buzzer) = sim_worker();
        worker.force_stop_and_reinitialize();
        assert_eq!(worker.reinit_count(), 1);
        assert_eq!(worker.force_stop_count(), 1);
    }

    #[test]
    fn hardware_fault_reinitialises_and_does_not_retry() {
        let (worker, buzzer) = sim_worker();
        buzzer.set_failing(true);
        assert!(!worker.play_tone_immediate(440.0, Duration::from_millis(5)));
        assert_eq!(worker.reinit_count(), 1);
        assert!(buzzer.played().is_empty());
    }

    #[test]
    fn panicking_task_does_not_kill_worker() {
        let (worker, buzzer) = sim_worker();
        worker.queue_function(|_| panic!("boom"));
        worker.play_sequence_async(vec![660.0], vec![Duration::from_millis(5)]);
        assert!(wait_until(|| buzzer.played() == vec![660.0]));
    }

    #[test]
    fn shutdown_is_idempotent() {
        let (worker, _buzzer) = sim_worker();
        worker.shutdown();
        worker.shutdown();
        worker.play_sequence_async(vec![100.0], vec![Duration::from_millis(5)]);
    }
}
