//! Wire-level scenarios against the emulator, exchanged through a duplex pipe.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};
use ujlaser_core::config::LaserConfig;
use ujlaser_core::keywords::{self, KeywordKind};
use ujlaser_emulator::{spawn_emulator, ArmState, EmulatorHandle, Fault};

struct Client {
    handle: EmulatorHandle,
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    write: WriteHalf<DuplexStream>,
}

impl Client {
    fn start() -> Self {
        let (handle, stream) = spawn_emulator(&LaserConfig::default());
        let (read, write) = tokio::io::split(stream);
        Self {
            handle,
            lines: BufReader::new(read).lines(),
            write,
        }
    }

    async fn send(&mut self, frame: &str) -> String {
        self.write.write_all(frame.as_bytes()).await.unwrap();
        self.lines.next_line().await.unwrap().unwrap()
    }

    async fn arm(&mut self) {
        assert_eq!(self.send(";LA:EN 1\r").await, "OK");
        tokio::time::sleep(Duration::from_secs(8)).await;
        assert_eq!(self.send(";LA:SS?\r").await, "3073");
    }
}

#[tokio::test(start_paused = true)]
async fn arming_sequence() {
    let mut c = Client::start();
    assert_eq!(c.send(";LA:SS?\r").await, "1024");
    assert_eq!(c.send(";LA:EN 1\r").await, "OK");
    assert_ne!(c.send(";LA:SS?\r").await, "3073");

    tokio::time::sleep(Duration::from_secs(8)).await;
    assert_eq!(c.send(";LA:SS?\r").await, "3073");
}

#[tokio::test(start_paused = true)]
async fn continuous_fire_sequence() {
    let mut c = Client::start();
    c.arm().await;

    assert_eq!(c.send(";LA:PE 2.0\r").await, "OK");
    assert_eq!(c.send(";LA:FL 1\r").await, "OK");
    assert_eq!(c.send(";LA:SS?\r").await, "3075");

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(c.send(";LA:SS?\r").await, "3073");
    assert_eq!(c.send(";LA:SC?\r").await, "2");
}

#[tokio::test(start_paused = true)]
async fn invalid_enable_argument_and_reset() {
    let mut c = Client::start();
    assert_eq!(c.send(";LA:EN 5\r").await, "?8");
    assert_eq!(c.handle.state(), ArmState::Disarmed);

    c.arm().await;
    assert_eq!(c.send(";LA:EM 2\r").await, "OK");
    assert_eq!(c.send(";LA:RS\r").await, "OK");
    assert_eq!(c.send(";LA:SS?\r").await, "1024");
    assert_eq!(c.send(";LA:EM?\r").await, "0");
}

#[tokio::test]
async fn fire_before_arming_is_unavailable() {
    let mut c = Client::start();
    assert_eq!(c.send(";LA:FL 1\r").await, "?8");
    assert_eq!(c.send(";LA:SS?\r").await, "1024");
}

#[tokio::test]
async fn enable_without_ready_to_enable_leaves_enabled_clear() {
    let mut c = Client::start();
    c.handle.inject_fault(Fault::ResonatorOverTemp);
    assert_eq!(c.send(";LA:EN 1\r").await, "?8");
    assert_eq!(c.send(";LA:EN?\r").await, "0");
    assert!(!c.handle.status().laser_enabled);
}

#[tokio::test(start_paused = true)]
async fn second_fire_is_rejected_without_touching_the_timer() {
    let mut c = Client::start();
    c.arm().await;
    assert_eq!(c.send(";LA:PE 4\r").await, "OK");
    assert_eq!(c.send(";LA:FL 1\r").await, "OK");

    tokio::time::sleep(Duration::from_secs(1)).await;
    let before = c.handle.with_engine(|e| e.timer_remaining());
    assert_eq!(c.send(";LA:FL 1\r").await, "?8");
    let after = c.handle.with_engine(|e| e.timer_remaining());
    assert_eq!(before, Some(Duration::from_secs(3)));
    assert_eq!(before, after);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(c.send(";LA:SS?\r").await, "3073");
}

#[tokio::test(start_paused = true)]
async fn disable_while_firing_aborts() {
    let mut c = Client::start();
    c.arm().await;
    assert_eq!(c.send(";LA:FL 1\r").await, "OK");
    assert_eq!(c.send(";LA:EN 0\r").await, "OK");
    assert_eq!(c.send(";LA:SS?\r").await, "1024");

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(c.send(";LA:SC?\r").await, "0");
}

#[tokio::test(start_paused = true)]
async fn fault_during_fire_forces_disarm() {
    let mut c = Client::start();
    c.arm().await;
    assert_eq!(c.send(";LA:PE 5\r").await, "OK");
    assert_eq!(c.send(";LA:FL 1\r").await, "OK");

    c.handle.inject_fault(Fault::ElectricalOverTemp);
    assert_eq!(c.send(";LA:SS?\r").await, (1 << 8).to_string());

    c.handle.clear_fault(Fault::ElectricalOverTemp);
    assert_eq!(c.send(";LA:SS?\r").await, "1024");
    assert_eq!(c.send(";LA:SC?\r").await, "0");
}

#[tokio::test]
async fn protocol_error_codes() {
    let mut c = Client::start();
    assert_eq!(c.send(";XX:SS?\r").await, "?1");
    assert_eq!(c.send(";LA:\r").await, "?2");
    assert_eq!(c.send(";LA:BC 1 2\r").await, "?3");
    assert_eq!(c.send(";LA:BC 0\r").await, "?5");
    assert_eq!(c.send(";LA:FOO 1\r").await, "?1");
    assert_eq!(c.send(";LA:FOO?\r").await, "?7");
    assert_eq!(c.send(";LA:SS 1\r").await, "?6");
}

#[tokio::test]
async fn every_setting_without_argument_is_invalid_parameter() {
    let mut c = Client::start();
    for (keyword, kind) in keywords::all() {
        if kind == KeywordKind::Setting {
            assert_eq!(c.send(&format!(";LA:{keyword}\r")).await, "?5", "{keyword}");
        }
    }
}

#[tokio::test]
async fn every_query_only_keyword_as_action_needs_question_mark() {
    let mut c = Client::start();
    for (keyword, kind) in keywords::all() {
        if kind == KeywordKind::QueryOnly {
            assert_eq!(c.send(&format!(";LA:{keyword}\r")).await, "?6", "{keyword}");
            assert_eq!(c.send(&format!(";LA:{keyword} 1\r")).await, "?6", "{keyword}");
        }
    }
}

#[tokio::test]
async fn save_and_recall_slots() {
    let mut c = Client::start();
    assert_eq!(c.send(";LA:BC 42\r").await, "OK");
    assert_eq!(c.send(";LA:EM 1\r").await, "OK");
    assert_eq!(c.send(";LA:SV 2\r").await, "OK");
    assert_eq!(c.send(";LA:RS\r").await, "OK");
    assert_eq!(c.send(";LA:BC?\r").await, "10");

    assert_eq!(c.send(";LA:RC 2\r").await, "OK");
    assert_eq!(c.send(";LA:BC?\r").await, "42");
    assert_eq!(c.send(";LA:RC?\r").await, "2");
    assert_eq!(c.send(";LA:SS?\r").await, (1024 + 4096).to_string());
}
