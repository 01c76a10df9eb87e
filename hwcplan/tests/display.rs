use hwcplan::{
    display::{HotplugEvent, HotplugSource, HotplugWatcher},
    null::{NullAllocator, NullBlitter, NullDisplay},
    Composer, DisplayContents, DisplayId, DisplayStateMachine, EventListener, Mode, PlannerConfig,
};
use hwcrect::{Rect, Rotation};
use std::{
    sync::{mpsc, Arc, Mutex},
    time::{Duration, Instant},
};

mod common;

/// Delivers the events sent through a channel.
struct ChannelSource(mpsc::Receiver<HotplugEvent>);

impl HotplugSource for ChannelSource {
    fn wait_event(&mut self, timeout: Duration) -> Option<HotplugEvent> {
        self.0.recv_timeout(timeout).ok()
    }
}

fn channel() -> (mpsc::Sender<HotplugEvent>, ChannelSource) {
    let (send, recv) = mpsc::channel();
    (send, ChannelSource(recv))
}

fn event(display: DisplayId, connected: bool) -> HotplugEvent {
    HotplugEvent { display, connected }
}

#[test]
fn watcher_feeds_the_state_machine() {
    common::set_timelimit_default();
    common::try_init_logger_for_default_harness();

    let machine = Arc::new(DisplayStateMachine::new(NullDisplay::new(), Rotation::Identity));
    let (send, source) = channel();
    let (done_send, done_recv) = mpsc::channel();

    let watcher = HotplugWatcher::spawn(Arc::clone(&machine), source, move |e| {
        let _ = done_send.send(e);
    })
    .unwrap();

    send.send(event(DisplayId::External, true)).unwrap();
    let e = done_recv.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(e, event(DisplayId::External, true));

    let external = machine.snapshot(DisplayId::External);
    assert!(external.is_active());
    assert_eq!(external.mode, Some(Mode::new(1280, 720, 60)));
    assert_eq!(external.device_clip, Rect::with_size(1280, 720));
    assert_eq!(machine.generation(), 2);

    send.send(event(DisplayId::External, false)).unwrap();
    done_recv.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(!machine.snapshot(DisplayId::External).connected);
    assert_eq!(machine.generation(), 3);

    // Stops even though the sender is still alive
    drop(watcher);
}

#[test]
fn external_display_without_modes_stays_disconnected() {
    common::set_timelimit_default();

    let device = NullDisplay::new().with_modes(DisplayId::External, Vec::new());
    let machine = Arc::new(DisplayStateMachine::new(device, Rotation::Identity));
    let (send, source) = channel();
    let (done_send, done_recv) = mpsc::channel();

    let _watcher = HotplugWatcher::spawn(Arc::clone(&machine), source, move |e| {
        let _ = done_send.send(e);
    })
    .unwrap();

    send.send(event(DisplayId::External, true)).unwrap();
    done_recv.recv_timeout(Duration::from_secs(5)).unwrap();

    assert!(!machine.snapshot(DisplayId::External).connected);
    // The attempt still counts as a transition
    assert_eq!(machine.generation(), 2);
}

#[derive(Default)]
struct RecordingListener {
    hotplugs: Mutex<Vec<(DisplayId, bool)>>,
}

impl RecordingListener {
    fn wait_for(&self, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.hotplugs.lock().unwrap().len() < count {
            assert!(Instant::now() < deadline, "hotplug event wasn't delivered");
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

impl EventListener for RecordingListener {
    fn hotplug(&self, display: DisplayId, connected: bool) {
        self.hotplugs.lock().unwrap().push((display, connected));
    }
}

fn frames() -> Vec<DisplayContents> {
    vec![
        DisplayContents::new(vec![
            common::layer(Rect::with_size(1280, 800)),
            common::layer(Rect::ltrb(100, 100, 300, 200)),
        ]),
        DisplayContents::new(vec![common::layer(Rect::with_size(1280, 720))]),
    ]
}

#[test]
fn composer_follows_hotplug() {
    common::set_timelimit_default();
    common::try_init_logger_for_default_harness();

    let listener = Arc::new(RecordingListener::default());
    let mut composer = Composer::with_listener(
        NullDisplay::new(),
        NullAllocator::new(),
        NullBlitter::new(),
        PlannerConfig {
            idle_minimum_fps: 0,
            ..PlannerConfig::default()
        },
        Arc::clone(&listener) as Arc<dyn EventListener>,
    )
    .unwrap();

    let (send, source) = channel();
    composer.watch_hotplug(source).unwrap();

    let mut frames = frames();
    composer.prepare(&mut frames);
    composer.set(&frames).unwrap();
    assert_eq!(
        composer.state_machine().device().post_count(DisplayId::External),
        0
    );

    send.send(event(DisplayId::External, true)).unwrap();
    listener.wait_for(1);

    composer.prepare(&mut frames);
    composer.set(&frames).unwrap();
    let device = composer.state_machine().device();
    assert_eq!(device.post_count(DisplayId::External), 1);
    let post = device.last_post(DisplayId::External).unwrap();
    assert_eq!(post.buffers.iter().flatten().count(), 1);
    assert!(!composer.plan(DisplayId::External).is_released());

    send.send(event(DisplayId::External, false)).unwrap();
    listener.wait_for(2);

    // Disconnecting turns the windows off once
    let posts = composer.state_machine().device().post_count(DisplayId::External);
    composer.prepare(&mut frames);
    assert!(composer.plan(DisplayId::External).is_released());
    composer.set(&frames).unwrap();
    assert_eq!(
        composer.state_machine().device().post_count(DisplayId::External),
        posts
    );

    assert_eq!(
        *listener.hotplugs.lock().unwrap(),
        vec![(DisplayId::External, true), (DisplayId::External, false)]
    );
}
