use std::net::SocketAddr;
use std::time::Duration;

use tinytelemetry::collector::{CollectorReport, CollectorServer};
use tinytelemetry::receiver::CollectorConfig;
use tinytelemetry::sink::MemorySink;
use tinytelemetry::transmitter::{SensorConfig, SensorSession};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const DEVICE_ID: u16 = 1001;

struct RunningCollector {
    addr: SocketAddr,
    sink: MemorySink,
    stop: oneshot::Sender<()>,
    task: JoinHandle<tinytelemetry::Result<CollectorReport>>,
}

impl RunningCollector {
    async fn start() -> Self {
        Self::start_with(
            CollectorConfig::new("127.0.0.1:0".parse().unwrap())
                .with_reorder_window(Duration::from_millis(200))
                .with_recv_timeout(Duration::from_millis(200)),
        )
        .await
    }

    async fn start_with(config: CollectorConfig) -> Self {
        let sink = MemorySink::new();
        let server = CollectorServer::bind(config, Box::new(sink.clone())).await.unwrap();
        let addr = server.local_addr().unwrap();

        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run(async move {
            let _ = stopped.await;
        }));

        Self { addr, sink, stop, task }
    }

    async fn stop(self) -> (CollectorReport, MemorySink) {
        let _ = self.stop.send(());
        let report = self.task.await.unwrap().unwrap();
        (report, self.sink)
    }
}

fn sensor_config(destination: SocketAddr) -> SensorConfig {
    SensorConfig::new(DEVICE_ID, destination)
        .with_grace_period(Duration::from_millis(300))
        .with_seed(42)
}

#[tokio::test]
async fn test_end_to_end_init_and_five_readings() {
    let collector = RunningCollector::start().await;

    let mut sensor = SensorSession::connect(sensor_config(collector.addr)).await.unwrap();
    sensor.send_init().await.unwrap();
    for i in 0..5 {
        sensor.send_data(21.0 + i as f64, 50.0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let sent = sensor.shutdown().await;

    assert_eq!(sent.sent, 6);
    assert_eq!(sent.acked, 5);
    assert_eq!(sent.lost, 0);
    assert_eq!(sent.still_pending, 0);

    let (report, sink) = collector.stop().await;
    let device = report.device(DEVICE_ID).expect("device registered");
    assert_eq!(device.packet_count, 6);
    assert_eq!(device.last_seq, Some(5));
    assert_eq!(report.stats.total_lost, 0);
    assert_eq!(report.stats.total_duplicates, 0);

    let records = sink.records();
    let seqs: Vec<u16> = records.iter().map(|r| r.seq_num).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    assert!(records.iter().all(|r| r.kind_label == "DATA" && !r.gap && !r.duplicate));

    println!("✓ INIT + 5 DATA delivered, acknowledged and logged in order");
}

#[tokio::test]
async fn test_batch_delivered_and_acknowledged() {
    let collector = RunningCollector::start().await;

    let config = sensor_config(collector.addr).with_batch_size(3);
    let mut sensor = SensorSession::connect(config).await.unwrap();
    sensor.send_init().await.unwrap();
    for _ in 0..3 {
        let (t, h) = sensor.simulate_reading();
        sensor.send_data(t, h).await.unwrap();
    }
    assert!(sensor.buffered_readings().is_empty());
    let sent = sensor.shutdown().await;

    assert_eq!(sent.acked, 1);
    assert_eq!(sent.lost, 0);

    let (report, sink) = collector.stop().await;
    let device = report.device(DEVICE_ID).unwrap();
    assert_eq!(device.packet_count, 2);
    assert_eq!(device.last_seq, Some(3));
    assert_eq!(report.stats.total_lost, 0);

    let records = sink.records();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.kind_label == "BATCH_DATA"));
    assert_eq!(records.iter().map(|r| r.seq_num).collect::<Vec<_>>(), vec![1, 2, 3]);

    println!("✓ BATCH of 3 readings delivered under one ACK");
}

#[tokio::test]
async fn test_simulated_loss_shows_as_gap() {
    let collector = RunningCollector::start().await;

    let mut sensor = SensorSession::connect(sensor_config(collector.addr)).await.unwrap();
    sensor.send_init().await.unwrap();

    sensor.set_packet_loss_rate(1.0).unwrap();
    sensor.send_data(22.0, 55.0).await.unwrap();
    sensor.set_packet_loss_rate(0.0).unwrap();
    sensor.send_data(22.5, 56.0).await.unwrap();
    assert_eq!(sensor.next_seq(), 3);

    let sent = sensor.shutdown().await;
    assert_eq!(sent.dropped, 1);
    assert_eq!(sent.acked, 1);

    let (report, sink) = collector.stop().await;
    assert_eq!(report.stats.total_lost, 1);
    assert_eq!(report.device(DEVICE_ID).unwrap().last_seq, Some(2));

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].seq_num, 2);
    assert!(records[0].gap);

    println!("✓ dropped seq 1 detected as a 1-packet gap");
}

#[tokio::test]
async fn test_retransmission_gives_up_after_ceiling() {
    // Bound but never read, so nothing is ever acknowledged
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let destination = silent.local_addr().unwrap();

    let config = SensorConfig::new(DEVICE_ID, destination)
        .with_initial_rtt(Duration::from_millis(50))
        .with_grace_period(Duration::from_millis(1200));
    let mut sensor = SensorSession::connect(config).await.unwrap();
    sensor.send_data(20.0, 40.0).await.unwrap();

    let sent = sensor.shutdown().await;
    assert_eq!(sent.sent, 1);
    assert_eq!(sent.acked, 0);
    assert_eq!(sent.retransmitted, 3);
    assert_eq!(sent.lost, 1);
    assert_eq!(sent.still_pending, 0);

    println!("✓ unacknowledged DATA retransmitted 3 times, then declared lost");
}

#[tokio::test]
async fn test_malformed_datagram_does_not_stop_collector() {
    let collector = RunningCollector::start().await;

    let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    raw.send_to(&[0x11, 0x03], collector.addr).await.unwrap();

    let mut sensor = SensorSession::connect(sensor_config(collector.addr)).await.unwrap();
    sensor.send_init().await.unwrap();
    sensor.send_data(23.0, 60.0).await.unwrap();
    let sent = sensor.shutdown().await;
    assert_eq!(sent.acked, 1);

    let (report, sink) = collector.stop().await;
    assert_eq!(report.stats.malformed, 1);
    assert_eq!(report.device(DEVICE_ID).unwrap().packet_count, 2);
    assert_eq!(sink.records().len(), 1);

    println!("✓ malformed datagram counted and skipped");
}

#[tokio::test]
async fn test_run_sends_heartbeats_between_sparse_readings() {
    let collector = RunningCollector::start().await;

    let config = sensor_config(collector.addr)
        .with_interval(Duration::from_millis(600))
        .with_heartbeat_interval(Duration::from_millis(200))
        .with_duration(Duration::from_millis(2500));
    let sent = SensorSession::connect(config).await.unwrap().run().await.unwrap();
    assert_eq!(sent.lost, 0);

    let (report, _sink) = collector.stop().await;
    let device = report.device(DEVICE_ID).unwrap();
    assert!(device.heartbeat_count > 0, "no heartbeat reached the collector");
    assert!(device.packet_count >= 2);

    println!("✓ {} heartbeats sent during quiet stretches", device.heartbeat_count);
}

#[tokio::test]
async fn test_simulated_drops_do_not_suppress_heartbeats() {
    let collector = RunningCollector::start().await;

    let config = sensor_config(collector.addr)
        .with_packet_loss_rate(1.0)
        .with_interval(Duration::from_millis(100))
        .with_heartbeat_interval(Duration::from_millis(400))
        .with_duration(Duration::from_millis(1500));
    let sent = SensorSession::connect(config).await.unwrap().run().await.unwrap();
    assert!(sent.dropped > 0);
    assert_eq!(sent.acked, 0);

    let (report, sink) = collector.stop().await;
    let device = report.device(DEVICE_ID).unwrap();
    assert!(device.heartbeat_count >= 2, "heartbeats: {}", device.heartbeat_count);
    assert_eq!(device.packet_count, 1);
    assert!(sink.records().is_empty());

    println!("✓ device with every DATA dropped still kept alive by heartbeats");
}

#[tokio::test]
async fn test_jittered_sends_all_acknowledged_and_logged_in_order() {
    let collector = RunningCollector::start_with(
        CollectorConfig::new("127.0.0.1:0".parse().unwrap())
            .with_reorder_window(Duration::from_secs(1))
            .with_recv_timeout(Duration::from_secs(2)),
    )
    .await;

    let config = sensor_config(collector.addr).with_jitter_max(Duration::from_millis(150));
    let mut sensor = SensorSession::connect(config).await.unwrap();
    sensor.send_init().await.unwrap();
    for i in 0..8 {
        sensor.send_data(20.0 + i as f64, 50.0).await.unwrap();
    }
    assert!(sensor.jitter_tasks_in_flight() > 0);
    let sent = sensor.shutdown().await;

    assert_eq!(sent.acked, 8);
    assert_eq!(sent.lost, 0);
    assert_eq!(sent.still_pending, 0);

    let (report, sink) = collector.stop().await;
    assert_eq!(report.stats.total_duplicates, 0);
    let records = sink.records();
    let mut seqs: Vec<u16> = records.iter().map(|r| r.seq_num).collect();
    seqs.sort_unstable();
    assert_eq!(seqs, (1..=8).collect::<Vec<u16>>());
    assert!(records.windows(2).all(|w| w[0].event_time <= w[1].event_time));

    println!("✓ 8 jittered DATA packets acknowledged and released in timestamp order");
}

#[tokio::test]
async fn test_oversized_batch_split_on_the_wire() {
    let collector = RunningCollector::start().await;

    let config = sensor_config(collector.addr).with_batch_size(10);
    let mut sensor = SensorSession::connect(config).await.unwrap();
    sensor.send_init().await.unwrap();
    for i in 0..10 {
        sensor.send_data(22.123 + i as f64, 55.456).await.unwrap();
    }
    assert!(sensor.buffered_readings().is_empty());
    let sent = sensor.shutdown().await;

    assert!(sent.acked >= 2, "acked {}", sent.acked);
    assert_eq!(sent.lost, 0);
    assert_eq!(sent.still_pending, 0);

    let (report, sink) = collector.stop().await;
    assert_eq!(report.stats.total_lost, 0);
    assert_eq!(report.stats.oversized, 0);
    assert_eq!(report.device(DEVICE_ID).unwrap().last_reading_seq, Some(10));

    let records = sink.records();
    assert!(records.iter().all(|r| r.kind_label == "BATCH_DATA" && !r.gap && !r.duplicate));
    assert_eq!(records.iter().map(|r| r.seq_num).collect::<Vec<_>>(), (1..=10).collect::<Vec<u16>>());

    println!("✓ 10-reading batch split into {} BATCH packets, every reading logged once", sent.acked);
}
