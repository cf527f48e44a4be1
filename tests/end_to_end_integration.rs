//! Messages sent over MLLP through deployed channels

mod common;

use common::builders::ChannelBuilder;
use common::{exchange, header, read_reply, ADT_A01};
use hl7_engine::codec::{add_framing, decode, MESSAGE_ROOT};
use hl7_engine::manager::ChannelManager;
use hl7_engine::scripting::{GlobalMaps, RhaiExecutor, SandboxLimits};
use hl7_engine::types::{Channel, ResponseMode};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

async fn deploy(manager: &ChannelManager, channel: Channel) -> SocketAddr {
    let id = channel.id().to_string();
    manager.add_channel(channel);
    manager.deploy(&id).await.unwrap().expect("listening channel")
}

fn manager() -> ChannelManager {
    ChannelManager::new(GlobalMaps::new(), Arc::new(RhaiExecutor::new()))
}

#[tokio::test]
async fn test_adt_roundtrip_returns_transformed_message() {
    let manager = manager();
    let channel = ChannelBuilder::new("adt")
        .source_rule(r#"msg.HL7Message.contains("MSH")"#)
        .source_step(
            r#"
            c("has_pid", msg.HL7Message.contains("PID"));
            msg.HL7Message.PID["PID.20"] = "CUSTOM";
            "#,
        )
        .listening()
        .build();
    let addr = deploy(&manager, channel).await;

    let reply = decode(&exchange(addr, ADT_A01).await);
    assert_eq!(reply.control_id().as_deref(), Some("123"));
    assert_eq!(reply.get("PID.20").as_deref(), Some("CUSTOM"));
    assert_eq!(reply.get("PID.5.2").as_deref(), Some("Jane"));

    let pipeline = manager.pipeline("adt").await.unwrap();
    assert_eq!(pipeline.channel_map().get("has_pid"), Some(json!(true)));
    manager.undeploy_all().await;
}

#[tokio::test]
async fn test_auto_ack_references_control_id() {
    let manager = manager();
    let channel = ChannelBuilder::new("ack")
        .response(ResponseMode::AutoAck)
        .listening()
        .build();
    let addr = deploy(&manager, channel).await;

    let ack = decode(&exchange(addr, ADT_A01).await);
    assert_eq!(ack.get("MSH.9").as_deref(), Some("ACK"));
    assert_eq!(ack.get("MSA.1").as_deref(), Some("AA"));
    assert_eq!(ack.get("MSA.2").as_deref(), Some("123"));
    manager.undeploy_all().await;
}

#[tokio::test]
async fn test_filtered_message_is_acknowledged() {
    let manager = manager();
    let channel = ChannelBuilder::new("filtered")
        .source_rule(r#"msg.HL7Message.contains("ORC")"#)
        .listening()
        .destination("Never", r#"g("reached", true);"#)
        .build();
    let addr = deploy(&manager, channel).await;

    let ack = decode(&exchange(addr, ADT_A01).await);
    assert_eq!(ack.get("MSA.1").as_deref(), Some("AA"));
    assert_eq!(manager.globals().global().get("reached"), None);
    manager.undeploy_all().await;
}

#[tokio::test]
async fn test_destination_failure_answers_nack() {
    let manager = manager();
    let channel = ChannelBuilder::new("failing")
        .listening()
        .destination("Good", r#"co("ok", true);"#)
        .destination("Bad", r#"throw "no route to lab""#)
        .build();
    let addr = deploy(&manager, channel).await;

    let nack = decode(&exchange(addr, ADT_A01).await);
    assert_eq!(nack.get("MSA.1").as_deref(), Some("AE"));
    assert_eq!(nack.get("MSA.2").as_deref(), Some("123"));
    let text = nack.get("MSA.3").unwrap_or_default();
    assert!(text.contains("Bad"), "unexpected error text {text}");

    let pipeline = manager.pipeline("failing").await.unwrap();
    assert_eq!(pipeline.destination_map(0).unwrap().get("ok"), Some(json!(true)));
    manager.undeploy_all().await;
}

#[tokio::test]
async fn test_runaway_script_answers_nack() {
    let limits = SandboxLimits {
        max_operations: 0,
        timeout_ms: 100,
        ..SandboxLimits::default()
    };
    let manager = ChannelManager::new(GlobalMaps::new(), Arc::new(RhaiExecutor::with_limits(limits)));
    let channel = ChannelBuilder::new("spin")
        .source_step("loop { }")
        .listening()
        .build();
    let addr = deploy(&manager, channel).await;

    let nack = decode(&exchange(addr, ADT_A01).await);
    assert_eq!(nack.get("MSA.1").as_deref(), Some("AE"));
    assert_eq!(nack.get("MSA.2").as_deref(), Some("123"));
    manager.undeploy_all().await;
}

#[tokio::test]
async fn test_oversized_index_answers_nack() {
    let manager = manager();
    let channel = ChannelBuilder::new("oversized")
        .source_step(r#"msg.HL7Message.PID["PID.5"] = #{ "PID.5.18446744073709551615": "x" };"#)
        .listening()
        .build();
    let addr = deploy(&manager, channel).await;

    let nack = decode(&exchange(addr, ADT_A01).await);
    assert_eq!(nack.get("MSA.1").as_deref(), Some("AE"));
    assert_eq!(nack.get("MSA.2").as_deref(), Some("123"));

    // The listener keeps serving afterwards
    let again = decode(&exchange(addr, ADT_A01).await);
    assert_eq!(again.get("MSA.1").as_deref(), Some("AE"));
    manager.undeploy_all().await;
}

#[tokio::test]
async fn test_connection_serves_messages_in_order() {
    let manager = manager();
    let channel = ChannelBuilder::new("ordered")
        .response(ResponseMode::AutoAck)
        .listening()
        .build();
    let addr = deploy(&manager, channel).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let wire: String = ["1", "2", "3"].iter().map(|id| add_framing(&header(id))).collect();
    stream.write_all(wire.as_bytes()).await.unwrap();

    for expected in ["1", "2", "3"] {
        let ack = decode(&read_reply(&mut stream).await);
        assert_eq!(ack.get("MSA.2").as_deref(), Some(expected));
    }
    manager.undeploy_all().await;
}

#[tokio::test]
async fn test_partial_frames_across_writes() {
    let manager = manager();
    let addr = deploy(&manager, ChannelBuilder::new("partial").listening().build()).await;

    let wire = add_framing(ADT_A01);
    let bytes = wire.as_bytes();
    let mut stream = TcpStream::connect(addr).await.unwrap();
    for chunk in bytes.chunks(7) {
        stream.write_all(chunk).await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }

    let reply = decode(&read_reply(&mut stream).await);
    assert_eq!(reply.control_id().as_deref(), Some("123"));
    manager.undeploy_all().await;
}

#[tokio::test]
async fn test_empty_source_message_answers_ack() {
    let manager = manager();
    let channel = ChannelBuilder::new("emptied")
        .source_step(&format!(r#"#{{ {}: #{{}} }}"#, MESSAGE_ROOT))
        .listening()
        .build();
    let addr = deploy(&manager, channel).await;

    let ack = decode(&exchange(addr, ADT_A01).await);
    assert_eq!(ack.get("MSA.1").as_deref(), Some("AA"));
    assert_eq!(ack.get("MSA.2").as_deref(), Some("123"));
    manager.undeploy_all().await;
}
