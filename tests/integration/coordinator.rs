//! Multi-unit coordination over real TCP port agents

use crate::common::*;
use parking_lot::Mutex;
use seacomm_core::core::coordinator::{
    CoordinatorSettings, InstrumentUnit, LifecycleCommand, MultiUnitCoordinator, SessionUnit,
};
use seacomm_core::core::sample::FieldValue;
use seacomm_core::core::transport::TcpConfig;
use seacomm_core::CommandRequest;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Start a fake port agent; returns its port and the port agent
/// commands it receives
async fn port_agent(samples: Vec<f64>) -> (u16, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            fake_ctd(stream, tx, samples).await;
        }
    });
    (port, rx)
}

fn unit(id: &str, port: u16, connects: &Arc<Mutex<Vec<String>>>) -> SessionUnit<State, Event, ()> {
    let connects = connects.clone();
    let name = id.to_string();
    SessionUnit::new(id, TcpConfig::new("127.0.0.1", port).timeout(2), move || {
        connects.lock().push(name.clone());
        ctd_session(&name)
    })
    .on(LifecycleCommand::Reset, Event::Discover)
    .on(LifecycleCommand::Start, Event::StartAutosample)
    .on(LifecycleCommand::Stop, Event::StopAutosample)
}

#[tokio::test]
async fn test_lifecycle_tagging_and_break() {
    let (port_a, mut commands_a) = port_agent(vec![10.5]).await;
    let (port_b, mut commands_b) = port_agent(vec![4.25, 4.5]).await;
    let connects = Arc::new(Mutex::new(Vec::new()));

    let settings = CoordinatorSettings {
        order: vec!["deep".into(), "shallow".into()],
        break_delay: Duration::from_millis(50),
        ..CoordinatorSettings::default()
    };
    let mut coordinator = MultiUnitCoordinator::new(settings);
    coordinator.add_unit(Arc::new(unit("shallow", port_a, &connects))).unwrap();
    coordinator.add_unit(Arc::new(unit("deep", port_b, &connects))).unwrap();

    coordinator.connect().await.unwrap();
    assert_eq!(*connects.lock(), ["deep", "shallow"]);

    let mut samples = coordinator.forward_samples(16).await;
    coordinator.reset().await.unwrap();
    coordinator.start().await.unwrap();

    let mut by_unit: HashMap<String, Vec<f64>> = HashMap::new();
    for _ in 0..3 {
        let tagged = tokio::time::timeout(Duration::from_secs(5), samples.recv())
            .await
            .unwrap()
            .unwrap();
        let t = tagged.sample.get("temperature").and_then(FieldValue::as_f64).unwrap();
        by_unit.entry(tagged.unit).or_default().push(t);
    }
    assert_eq!(by_unit["shallow"], [10.5]);
    assert_eq!(by_unit["deep"], [4.25, 4.5]);

    coordinator.coordinated_break().await.unwrap();
    for commands in [&mut commands_a, &mut commands_b] {
        let cmd = tokio::time::timeout(Duration::from_secs(5), commands.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cmd, "break 500");
    }

    let results = coordinator.broadcast_command(CommandRequest::new("stop")).await;
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, r)| r.is_ok()));

    coordinator.disconnect().await.unwrap();
    let shallow = coordinator.unit("shallow").unwrap();
    assert!(shallow.subscribe().await.is_none());
}

#[tokio::test]
async fn test_unmapped_lifecycle_command_fails() {
    let (port, _commands) = port_agent(Vec::new()).await;
    let connects = Arc::new(Mutex::new(Vec::new()));
    let unit = SessionUnit::new("bare", TcpConfig::new("127.0.0.1", port).timeout(2), move || {
        connects.lock().push("bare".to_string());
        ctd_session("bare")
    });

    unit.command(LifecycleCommand::Connect).await.unwrap();
    assert!(unit.command(LifecycleCommand::Start).await.is_err());
    unit.command(LifecycleCommand::Disconnect).await.unwrap();
}

#[tokio::test]
async fn test_commands_before_connect_fail() {
    let unit = SessionUnit::new("idle", TcpConfig::new("127.0.0.1", 9), || ctd_session("idle"));
    assert!(matches!(
        unit.send(CommandRequest::new("stop")).await,
        Err(seacomm_core::SessionError::NotConnected)
    ));
}
