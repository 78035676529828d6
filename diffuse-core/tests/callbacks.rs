//! Routing of engine log/progress events to per-context listeners.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{model_file, quick_params, runtime, Event, Recorder, ScriptedEngine};
use diffuse_core::{ContextConfig, Error, LogLevel, LogListener, UpscalerConfig};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_events_arrive_in_emission_order() {
    let engine = ScriptedEngine::new();
    let (_dir, model) = model_file();
    let recorder = Recorder::new();
    let ctx = runtime(&engine)
        .create_context(
            ContextConfig::with_model(&model),
            Some(recorder.log_listener()),
            Some(recorder.progress_listener()),
        )
        .await
        .unwrap();

    ctx.txt2img(quick_params("ordered")).unwrap().await.unwrap();
    assert!(
        recorder
            .wait_until(|events| events.len() >= 6)
            .await
    );

    let events = recorder.snapshot();
    // Construction logs come first, through the same listeners.
    assert!(matches!(&events[0], Event::Log(LogLevel::Info, text) if text.starts_with("loading model")));
    let job: Vec<String> = events[1..]
        .iter()
        .map(|event| match event {
            Event::Log(_, text) => text.clone(),
            Event::Progress(p) => format!("{}/{}", p.step, p.steps),
        })
        .collect();
    assert_eq!(
        job,
        vec!["txt2img 'ordered'", "1/3", "2/3", "3/3", "txt2img completed"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_contexts_do_not_cross_talk() {
    let engine = ScriptedEngine::slow(Duration::from_millis(3));
    let (_dir, model) = model_file();
    let rt = runtime(&engine);

    let (rec_a, rec_b) = (Recorder::new(), Recorder::new());
    let a = rt
        .create_context(
            ContextConfig::with_model(&model),
            Some(rec_a.log_listener()),
            Some(rec_a.progress_listener()),
        )
        .await
        .unwrap();
    let b = rt
        .create_context(
            ContextConfig::with_model(&model),
            Some(rec_b.log_listener()),
            Some(rec_b.progress_listener()),
        )
        .await
        .unwrap();

    let mut tickets = Vec::new();
    for i in 0..3 {
        tickets.push(a.txt2img(quick_params(&format!("a{}", i))).unwrap());
        tickets.push(b.txt2img(quick_params(&format!("b{}", i))).unwrap());
    }
    for ticket in tickets {
        ticket.await.unwrap();
    }

    let done = |events: &[Event]| {
        events
            .iter()
            .filter(|e| matches!(e, Event::Log(_, t) if t == "txt2img completed"))
            .count()
            == 3
    };
    assert!(rec_a.wait_until(done).await);
    assert!(rec_b.wait_until(done).await);

    let prompts = |recorder: &Recorder| -> Vec<String> {
        recorder
            .logs()
            .into_iter()
            .filter(|text| text.starts_with("txt2img '"))
            .collect()
    };
    assert_eq!(prompts(&rec_a), vec!["txt2img 'a0'", "txt2img 'a1'", "txt2img 'a2'"]);
    assert_eq!(prompts(&rec_b), vec!["txt2img 'b0'", "txt2img 'b1'", "txt2img 'b2'"]);
    assert_eq!(rec_a.progress().len(), 9);
    assert_eq!(rec_b.progress().len(), 9);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_events_before_registration_are_not_replayed() {
    let engine = ScriptedEngine::new();
    let (_dir, model) = model_file();
    let ctx = runtime(&engine)
        .create_context(ContextConfig::with_model(&model), None, None)
        .await
        .unwrap();

    ctx.txt2img(quick_params("unheard")).unwrap().await.unwrap();

    let recorder = Recorder::new();
    ctx.set_log_listener(Some(recorder.log_listener())).unwrap();
    ctx.txt2img(quick_params("heard")).unwrap().await.unwrap();
    assert!(
        recorder
            .wait_until(|events| events.len() >= 2)
            .await
    );

    let logs = recorder.logs();
    assert_eq!(logs, vec!["txt2img 'heard'", "txt2img completed"]);
    // No progress listener, so no progress events either.
    assert!(recorder.progress().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_replaced_listener_stops_receiving() {
    let engine = ScriptedEngine::new();
    let (_dir, model) = model_file();
    let (first, second) = (Recorder::new(), Recorder::new());
    let ctx = runtime(&engine)
        .create_context(
            ContextConfig::with_model(&model),
            None,
            Some(first.progress_listener()),
        )
        .await
        .unwrap();

    ctx.txt2img(quick_params("one")).unwrap().await.unwrap();
    assert!(first.wait_until(|events| events.len() == 3).await);

    ctx.set_progress_listener(Some(second.progress_listener())).unwrap();
    ctx.txt2img(quick_params("two")).unwrap().await.unwrap();
    assert!(second.wait_until(|events| events.len() == 3).await);

    assert_eq!(first.progress().len(), 3);
    ctx.set_progress_listener(None).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_release_logs_reach_listener_before_dispose_resolves() {
    let engine = ScriptedEngine::new();
    let (_dir, model) = model_file();
    let recorder = Recorder::new();
    let rt = runtime(&engine);
    let ctx = rt
        .create_context(
            ContextConfig::with_model(&model),
            Some(recorder.log_listener()),
            None,
        )
        .await
        .unwrap();

    ctx.dispose().unwrap().await.unwrap();
    let logs = recorder.logs();
    assert_eq!(logs.len(), 2, "got {:?}", logs);
    assert!(logs[0].starts_with("loading model"));
    assert_eq!(logs[1], "free_sd_ctx");

    let upscaled = Recorder::new();
    let upscaler = rt
        .create_upscaler(UpscalerConfig::new(&model), Some(upscaled.log_listener()), None)
        .await
        .unwrap();
    upscaler.dispose().unwrap().await.unwrap();
    assert_eq!(upscaled.logs(), vec!["free_upscaler_ctx"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_listener_backlog_drains_then_goes_silent() {
    let engine = ScriptedEngine::new();
    let (_dir, model) = model_file();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let listener: LogListener = Arc::new(move |_level: LogLevel, text: &str| {
        std::thread::sleep(Duration::from_millis(10));
        sink.lock().unwrap().push(text.to_string());
    });
    let ctx = runtime(&engine)
        .create_context(ContextConfig::with_model(&model), Some(listener), None)
        .await
        .unwrap();

    // The engine finishes long before the listener has caught up.
    let tickets: Vec<_> = (0..3)
        .map(|i| ctx.txt2img(quick_params(&format!("job {}", i))).unwrap())
        .collect();
    let dispose = ctx.dispose().unwrap();
    for ticket in tickets {
        ticket.await.unwrap();
    }
    assert!(seen.lock().unwrap().len() < 8, "listener should still be behind");

    dispose.await.unwrap();
    let delivered = seen.lock().unwrap().clone();
    assert_eq!(delivered.len(), 8);
    assert_eq!(delivered.last().map(String::as_str), Some("free_sd_ctx"));

    assert_eq!(ctx.set_log_listener(None), Err(Error::Disposed));
    assert_eq!(ctx.set_progress_listener(None), Err(Error::Disposed));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*seen.lock().unwrap(), delivered);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_construction_logs_reach_listener() {
    let engine = ScriptedEngine::new();
    let recorder = Recorder::new();
    let err = runtime(&engine)
        .create_context(
            ContextConfig::with_model("/nonexistent/model.gguf"),
            Some(recorder.log_listener()),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Construction(_)));

    // Delivered before the error is returned, in emission order.
    assert_eq!(
        recorder.snapshot(),
        vec![
            Event::Log(
                LogLevel::Info,
                "loading model from '/nonexistent/model.gguf'".to_string()
            ),
            Event::Log(LogLevel::Error, "init model loader from file failed".to_string()),
        ]
    );
}
