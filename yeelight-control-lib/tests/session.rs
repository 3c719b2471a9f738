use std::net::SocketAddr;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use yeelight_control_lib::control_interface::bulb_info::{
    ColorMode, DeviceRecord, Effect, PowerStatus,
};
use yeelight_control_lib::control_interface::streaming::StreamingState;
use yeelight_control_lib::control_interface::{Bulb, BulbConfig};
use yeelight_control_lib::error::BulbError;
use yeelight_control_lib::led::color::RGB;
use yeelight_control_lib::util::traits::LightControl;

const SUPPORT: [&str; 8] = [
    "get_prop",
    "set_power",
    "toggle",
    "set_bright",
    "set_rgb",
    "start_cf",
    "set_music",
    "set_default",
];

type Responder = Box<dyn Fn(&Value) -> Vec<String> + Send + Sync>;

enum Control {
    Line(String),
    Close,
}

/// An in-process bulb: answers the control connection through a responder
/// and dials back when asked to enter streaming mode.
struct FakeBulb {
    address: SocketAddr,
    requests: mpsc::UnboundedReceiver<Value>,
    streamed: mpsc::UnboundedReceiver<Value>,
    control: mpsc::UnboundedSender<Control>,
}

fn reply(request: &Value, result: Value) -> String {
    format!("{}\r\n", json!({ "id": request["id"], "result": result }))
}

fn standard_reply(power: &str, request: &Value) -> Vec<String> {
    match request["method"].as_str() {
        Some("get_prop") => vec![reply(
            request,
            json!([power, "50", "1", "4000", "16711680", "100", "35", "fake"]),
        )],
        _ => vec![reply(request, json!(["ok"]))],
    }
}

fn standard(power: &'static str) -> Responder {
    Box::new(move |request| standard_reply(power, request))
}

async fn dial_back(ip: String, port: u16, streamed: mpsc::UnboundedSender<Value>) {
    let Ok(stream) = TcpStream::connect((ip.as_str(), port)).await else {
        return;
    };
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let _ = streamed.send(serde_json::from_str(line.trim()).unwrap());
    }
}

impl FakeBulb {
    async fn start(responder: Responder) -> FakeBulb {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (request_tx, requests) = mpsc::unbounded_channel();
        let (streamed_tx, streamed) = mpsc::unbounded_channel();
        let (control, mut control_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut lines = BufReader::new(reader).lines();

            loop {
                tokio::select! {
                    line = lines.next_line() => {
                        let Ok(Some(line)) = line else { break };
                        let request: Value = serde_json::from_str(line.trim()).unwrap();
                        if request["method"] == "set_music" && request["params"][0] == 1 {
                            let ip = request["params"][1].as_str().unwrap().to_string();
                            let port = request["params"][2].as_u64().unwrap() as u16;
                            tokio::spawn(dial_back(ip, port, streamed_tx.clone()));
                        }
                        for line in responder(&request) {
                            let _ = writer.write_all(line.as_bytes()).await;
                        }
                        let _ = request_tx.send(request);
                    }
                    event = control_rx.recv() => match event {
                        Some(Control::Line(line)) => {
                            let _ = writer.write_all(line.as_bytes()).await;
                        }
                        Some(Control::Close) | None => break,
                    },
                }
            }
        });

        FakeBulb {
            address,
            requests,
            streamed,
            control,
        }
    }

    /// Returns the next request with `method`, skipping others.
    async fn next_request(&mut self, method: &str) -> Value {
        loop {
            let request = tokio::time::timeout(Duration::from_secs(2), self.requests.recv())
                .await
                .expect("no request in time")
                .expect("fake bulb stopped");
            if request["method"] == method {
                return request;
            }
        }
    }

    async fn next_streamed(&mut self) -> Value {
        tokio::time::timeout(Duration::from_secs(2), self.streamed.recv())
            .await
            .expect("no streamed frame in time")
            .expect("streaming connection closed")
    }

    fn push(&self, line: &str) {
        let _ = self.control.send(Control::Line(format!("{}\r\n", line)));
    }

    fn close(&self) {
        let _ = self.control.send(Control::Close);
    }
}

fn config() -> BulbConfig {
    BulbConfig::default()
        .with_poll_interval(Duration::from_secs(60))
        .with_command_timeout(Duration::from_millis(300))
}

async fn connect(fake: &FakeBulb) -> Bulb {
    let mut record = DeviceRecord::new(fake.address);
    record.device_id = "0x1".to_string();
    record.support = SUPPORT.iter().map(|method| method.to_string()).collect();
    Bulb::connect(record, config(), &CancellationToken::new())
        .await
        .unwrap()
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_commands_are_correlated_in_order() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut fake = FakeBulb::start(standard("on")).await;
    let bulb = connect(&fake).await;
    let cancel = CancellationToken::new();

    let poll = fake.next_request("get_prop").await;
    assert_eq!(poll["id"], 1);
    assert_eq!(
        poll["params"],
        json!(["power", "bright", "color_mode", "ct", "rgb", "hue", "sat", "name"])
    );
    eventually(|| bulb.power() == PowerStatus::On).await;

    let values = bulb
        .execute(
            "set_power",
            vec![json!("on"), json!("smooth"), json!(500)],
            &cancel,
        )
        .await
        .unwrap();
    assert!(values.is_empty());

    bulb.set_brightness(40, Effect::Smooth, Duration::from_millis(500), &cancel)
        .await
        .unwrap();
    assert_eq!(bulb.snapshot().state.brightness, 40);

    let power = fake.next_request("set_power").await;
    assert_eq!(power["id"], 2);
    let bright = fake.next_request("set_bright").await;
    assert_eq!(bright["id"], 3);
    assert_eq!(bright["params"], json!([40, "smooth", 500]));

    bulb.disconnect().await;
    assert!(!bulb.is_connected());
    assert!(matches!(
        bulb.toggle(Effect::Sudden, Duration::ZERO, &cancel).await,
        Err(BulbError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_guards_reject_without_writing() {
    let mut fake = FakeBulb::start(standard("off")).await;
    let bulb = connect(&fake).await;
    let cancel = CancellationToken::new();

    fake.next_request("get_prop").await;
    eventually(|| bulb.snapshot().state.name == "fake").await;

    assert!(matches!(
        bulb.execute("set_scene", vec![json!("color")], &cancel).await,
        Err(BulbError::UnsupportedMethod(_))
    ));
    assert!(matches!(
        bulb.set_brightness(20, Effect::Sudden, Duration::ZERO, &cancel)
            .await,
        Err(BulbError::DeviceOff(_))
    ));
    assert!(matches!(
        bulb.set_brightness(0, Effect::Sudden, Duration::ZERO, &cancel)
            .await,
        Err(BulbError::InvalidArgument(_))
    ));

    bulb.turn_on(Effect::Smooth, Duration::from_millis(300), &cancel)
        .await
        .unwrap();
    assert_eq!(bulb.power(), PowerStatus::On);

    // The rejected commands never reached the bulb nor used an id.
    let next = fake.requests.recv().await.unwrap();
    assert_eq!(next["method"], "set_power");
    assert_eq!(next["id"], 2);

    bulb.set_brightness(20, Effect::Sudden, Duration::ZERO, &cancel)
        .await
        .unwrap();
    bulb.disconnect().await;
}

#[tokio::test]
async fn test_device_error_and_timeout() {
    let responder: Responder = Box::new(|request| match request["method"].as_str() {
        Some("set_rgb") => vec![format!(
            "{}\r\n",
            json!({ "id": request["id"], "error": { "code": -1, "message": "unsupported method" } })
        )],
        Some("set_bright") => Vec::new(),
        _ => standard_reply("on", request),
    });
    let mut fake = FakeBulb::start(responder).await;
    let bulb = connect(&fake).await;
    let cancel = CancellationToken::new();

    fake.next_request("get_prop").await;
    eventually(|| bulb.snapshot().state.brightness == 50).await;

    match bulb
        .set_rgb(RGB::new(0, 0, 255), Effect::Sudden, Duration::ZERO, &cancel)
        .await
    {
        Err(BulbError::Device { code, message, .. }) => {
            assert_eq!(code, -1);
            assert_eq!(message, "unsupported method");
        }
        other => panic!("expected a device error, got {:?}", other),
    }
    assert_eq!(bulb.snapshot().state.rgb, 16711680);

    assert!(matches!(
        bulb.set_brightness(10, Effect::Sudden, Duration::ZERO, &cancel)
            .await,
        Err(BulbError::Timeout(_))
    ));
    assert_eq!(bulb.snapshot().state.brightness, 50);

    // The session is still usable after a timeout.
    bulb.toggle(Effect::Sudden, Duration::ZERO, &cancel)
        .await
        .unwrap();
    assert_eq!(bulb.power(), PowerStatus::Off);
    bulb.disconnect().await;
}

#[tokio::test]
async fn test_cancelled_command_is_not_sent() {
    let mut fake = FakeBulb::start(standard("on")).await;
    let bulb = connect(&fake).await;
    fake.next_request("get_prop").await;
    eventually(|| bulb.power() == PowerStatus::On).await;

    let cancelled = CancellationToken::new();
    cancelled.cancel();
    assert!(matches!(
        bulb.set_brightness(33, Effect::Sudden, Duration::ZERO, &cancelled)
            .await,
        Err(BulbError::Cancelled)
    ));
    assert!(matches!(
        bulb.set_default(&cancelled).await,
        Err(BulbError::Cancelled)
    ));
    assert_eq!(bulb.snapshot().state.brightness, 50);
    assert!(bulb.is_connected());

    bulb.toggle(Effect::Sudden, Duration::ZERO, &CancellationToken::new())
        .await
        .unwrap();
    let next = fake.requests.recv().await.unwrap();
    assert_eq!(next["method"], "toggle");
    assert_eq!(next["id"], 2);
    bulb.disconnect().await;
}

#[tokio::test]
async fn test_replies_out_of_order() {
    let responder: Responder = Box::new(|request| match request["method"].as_str() {
        Some("set_bright") => Vec::new(),
        _ => standard_reply("on", request),
    });
    let mut fake = FakeBulb::start(responder).await;
    let bulb = connect(&fake).await;
    let cancel = CancellationToken::new();
    fake.next_request("get_prop").await;
    eventually(|| bulb.power() == PowerStatus::On).await;

    let (bright, rgb) = tokio::join!(
        bulb.set_brightness(30, Effect::Sudden, Duration::ZERO, &cancel),
        async {
            let held = fake.next_request("set_bright").await;
            let rgb = bulb
                .set_rgb(RGB::new(0, 0, 255), Effect::Sudden, Duration::ZERO, &cancel)
                .await;
            fake.push(&json!({ "id": held["id"], "result": ["ok"] }).to_string());
            rgb
        }
    );
    bright.unwrap();
    rgb.unwrap();

    let state = bulb.snapshot().state;
    assert_eq!(state.brightness, 30);
    assert_eq!(state.rgb, 255);
    bulb.disconnect().await;
}

#[tokio::test]
async fn test_set_hsv_sends_color_flow() {
    let mut fake = FakeBulb::start(standard("on")).await;
    let bulb = connect(&fake).await;
    let cancel = CancellationToken::new();
    fake.next_request("get_prop").await;

    fake.push(r#"{"method":"props","params":{"color_mode":2}}"#);
    eventually(|| bulb.snapshot().state.color_mode == ColorMode::ColorTemperature).await;

    bulb.set_hsv(120, 100, 60, Duration::from_millis(500), &cancel)
        .await
        .unwrap();
    let flow = fake.next_request("start_cf").await;
    assert_eq!(flow["params"], json!([1, 1, "500,1,65280,60"]));

    let state = bulb.snapshot().state;
    assert_eq!(state.color_mode, ColorMode::Rgb);
    assert_eq!(state.hue, 120);
    assert_eq!(state.saturation, 100);
    assert_eq!(state.brightness, 60);
    assert_eq!(state.rgb, 65280);
    bulb.disconnect().await;
}

#[tokio::test]
async fn test_notifications_and_refresh() {
    let mut fake = FakeBulb::start(standard("on")).await;
    let bulb = connect(&fake).await;
    let cancel = CancellationToken::new();
    fake.next_request("get_prop").await;

    fake.push(r#"{"method":"props","params":{"power":"off","bright":"10","ct":2700}}"#);
    eventually(|| {
        let state = bulb.snapshot().state;
        state.power == PowerStatus::Off && state.brightness == 10 && state.color_temperature == 2700
    })
    .await;

    let record = bulb.refresh(&cancel).await.unwrap();
    assert_eq!(record.state.power, PowerStatus::On);
    assert_eq!(record.state.brightness, 50);
    assert_eq!(record.state.color_temperature, 4000);
    assert_eq!(record.state.rgb, 16711680);
    assert_eq!(record.rgb(), RGB::new(255, 0, 0));
    assert_eq!(record.state.hue, 100);
    assert_eq!(record.state.saturation, 35);
    assert_eq!(record.device_id, "0x1");
    bulb.disconnect().await;
}

#[tokio::test]
async fn test_connection_loss_fails_pending_command() {
    let responder: Responder = Box::new(|request| match request["method"].as_str() {
        Some("set_default") => Vec::new(),
        _ => standard_reply("on", request),
    });
    let mut fake = FakeBulb::start(responder).await;
    let bulb = connect(&fake).await;
    let cancel = CancellationToken::new();
    fake.next_request("get_prop").await;

    let (result, _) = tokio::join!(bulb.set_default(&cancel), async {
        fake.next_request("set_default").await;
        fake.close();
    });
    assert!(matches!(result, Err(BulbError::ConnectionClosed)));

    eventually(|| !bulb.is_connected()).await;
    assert!(matches!(
        bulb.set_default(&cancel).await,
        Err(BulbError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_streaming_round_trip() {
    let mut fake = FakeBulb::start(standard("on")).await;
    let bulb = connect(&fake).await;
    fake.next_request("get_prop").await;
    eventually(|| bulb.power() == PowerStatus::On).await;
    assert_eq!(bulb.streaming_state(), StreamingState::Idle);

    let cancel = CancellationToken::new();
    let bulb_ref = &bulb;
    let result = bulb
        .enable_streaming_mode(&cancel, |streaming, session| async move {
            assert_eq!(bulb_ref.streaming_state(), StreamingState::Active);
            let nested = bulb_ref
                .enable_streaming_mode(&session, |_, _| async { Ok::<_, BulbError>(()) })
                .await;
            assert!(matches!(nested, Err(BulbError::InvalidState(_))));

            streaming
                .set_rgb(RGB::new(0, 255, 0), Effect::Sudden, Duration::ZERO, &session)
                .await?;
            streaming
                .set_brightness(70, Effect::Sudden, Duration::ZERO, &session)
                .await?;
            Ok::<_, BulbError>(streaming.snapshot().state.brightness)
        })
        .await
        .unwrap();
    assert_eq!(result, 70);
    assert_eq!(bulb.streaming_state(), StreamingState::Idle);
    assert_eq!(bulb.snapshot().state.rgb, RGB::new(0, 255, 0).packed());

    let request = fake.next_request("set_music").await;
    assert_eq!(request["params"][0], 1);
    assert_eq!(request["params"][1], "127.0.0.1");

    let first = fake.next_streamed().await;
    assert_eq!(first["id"], 1);
    assert_eq!(first["method"], "set_rgb");
    assert_eq!(first["params"], json!([65280, "sudden", 0]));
    let second = fake.next_streamed().await;
    assert_eq!(second["id"], 2);
    assert_eq!(second["method"], "set_bright");

    let revert = fake.next_request("set_music").await;
    assert_eq!(revert["params"], json!([0]));
    bulb.disconnect().await;
}

#[tokio::test]
async fn test_streaming_cancel_closes_listener() {
    let mut fake = FakeBulb::start(standard("on")).await;
    let bulb = connect(&fake).await;
    fake.next_request("get_prop").await;

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    let result = bulb
        .enable_streaming_mode(&cancel, |_, _| async move {
            canceller.cancel();
            std::future::pending::<Result<(), BulbError>>().await
        })
        .await;
    assert!(matches!(result, Err(BulbError::Cancelled)));
    assert_eq!(bulb.streaming_state(), StreamingState::Idle);

    let request = fake.next_request("set_music").await;
    let port = request["params"][2].as_u64().unwrap() as u16;
    let revert = fake.next_request("set_music").await;
    assert_eq!(revert["params"], json!([0]));
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());

    // The control session survives the streaming session.
    assert!(bulb.is_connected());
    bulb.disable_streaming_mode(&CancellationToken::new())
        .await
        .unwrap();
    let revert = fake.next_request("set_music").await;
    assert_eq!(revert["params"], json!([0]));
    bulb.disconnect().await;
}

#[tokio::test]
async fn test_unanswered_streaming_request_is_reverted() {
    let responder: Responder = Box::new(|request| {
        if request["method"] == "set_music" && request["params"][0] == 1 {
            Vec::new()
        } else {
            standard_reply("on", request)
        }
    });
    let mut fake = FakeBulb::start(responder).await;
    let bulb = connect(&fake).await;
    fake.next_request("get_prop").await;

    let result = bulb
        .enable_streaming_mode(&CancellationToken::new(), |_, _| async {
            Ok::<_, BulbError>(())
        })
        .await;
    assert!(matches!(result, Err(BulbError::Timeout(_))));
    assert_eq!(bulb.streaming_state(), StreamingState::Idle);

    let request = fake.next_request("set_music").await;
    assert_eq!(request["params"][0], 1);
    let revert = fake.next_request("set_music").await;
    assert_eq!(revert["params"], json!([0]));
    bulb.disconnect().await;
}
