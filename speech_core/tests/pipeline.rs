mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use speech_core::builtin::FlowDecoder;
use speech_core::request::SpeakerRef;
use speech_core::{
    AudioClip, ErrorKind, Language, ModeKind, PipelineConfig, ReferenceClip, Stage, Stages, Synthesis,
    SynthesisError, SynthesisMode, SynthesisRequest, Transcriber,
};

use common::*;

fn fixed(id: &str) -> SynthesisMode {
    SynthesisMode::FixedSpeaker { speaker_id: id.to_string() }
}

#[tokio::test]
async fn fixed_speaker_produces_audio() {
    let synth = synthesizer(PipelineConfig::default()).await;
    let clip = synth
        .synthesize_clip(SynthesisRequest::new("Hello world", fixed("spk_A")))
        .await
        .unwrap();
    assert_eq!(clip.sample_rate, 24_000);
    assert!(clip.duration_secs() > 0.0);
    assert!(clip.samples.iter().all(|s| s.is_finite() && s.abs() <= 1.0));
}

#[tokio::test]
async fn streamed_chunks_concatenate_to_batch_output() {
    let synth = synthesizer(PipelineConfig::default()).await;
    let text = "The first sentence is here. Then a second one follows, somewhat longer than the first. And a third.";

    let batch = synth
        .synthesize_clip(SynthesisRequest::new(text, fixed("spk_A")).seed(7))
        .await
        .unwrap();

    let stream = match synth
        .synthesize(SynthesisRequest::new(text, fixed("spk_A")).seed(7).streaming(true))
        .await
        .unwrap()
    {
        Synthesis::Stream(s) => s,
        Synthesis::Clip(_) => panic!("expected a stream"),
    };
    let chunks: Vec<_> = stream.collect().await;
    assert!(chunks.len() > 1);
    let mut joined = Vec::new();
    for (i, chunk) in chunks.into_iter().enumerate() {
        let chunk = chunk.unwrap();
        assert_eq!(chunk.index, i);
        joined.extend(chunk.samples);
    }
    assert_eq!(joined, batch.samples);
}

#[tokio::test]
async fn same_seed_is_deterministic() {
    let synth = synthesizer(PipelineConfig::default()).await;
    let req = || SynthesisRequest::new("Deterministic output please.", fixed("spk_B")).seed(11);
    let a = synth.synthesize_clip(req()).await.unwrap();
    let b = synth.synthesize_clip(req()).await.unwrap();
    assert_eq!(a, b);

    let c = synth
        .synthesize_clip(SynthesisRequest::new("Deterministic output please.", fixed("spk_B")).seed(12))
        .await
        .unwrap();
    assert_ne!(a.samples, c.samples);
}

#[tokio::test]
async fn duration_tracks_text_length() {
    let synth = synthesizer(PipelineConfig::default()).await;
    let sentence = "This sentence has a moderate length. ";
    let short = synth
        .synthesize_clip(SynthesisRequest::new(sentence, fixed("spk_A")))
        .await
        .unwrap();
    let long = synth
        .synthesize_clip(SynthesisRequest::new(sentence.repeat(4), fixed("spk_A")))
        .await
        .unwrap();
    let ratio = long.duration_secs() / short.duration_secs();
    assert!(ratio > 3.0 && ratio < 5.0, "ratio {ratio}");
}

#[tokio::test]
async fn speed_shortens_output() {
    let synth = synthesizer(PipelineConfig::default()).await;
    let text = "Speaking rate changes the length of the result.";
    let normal = synth.synthesize_clip(SynthesisRequest::new(text, fixed("spk_A"))).await.unwrap();
    let fast = synth
        .synthesize_clip(SynthesisRequest::new(text, fixed("spk_A")).speed(2.0))
        .await
        .unwrap();
    assert!(fast.duration_secs() < normal.duration_secs() * 0.6);
}

#[tokio::test]
async fn speed_out_of_range_is_invalid_input() {
    let synth = synthesizer(PipelineConfig::default()).await;
    let err = synth
        .synthesize_clip(SynthesisRequest::new("Too fast.", fixed("spk_A")).speed(5.0))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert_eq!(err.stage, Stage::Validate);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn thirty_concurrent_requests_match_their_sequential_output() {
    let config = PipelineConfig { max_concurrent_requests: 4, ..Default::default() };
    let synth = synthesizer(config).await;

    let request = |i: usize| {
        let speaker = if i % 2 == 0 { "spk_A" } else { "spk_B" };
        SynthesisRequest::new(format!("Request number {i} is being spoken."), fixed(speaker)).seed(i as u64 + 1)
    };

    let mut expected = Vec::with_capacity(30);
    for i in 0..30 {
        expected.push(synth.synthesize_clip(request(i)).await.unwrap());
    }

    let handles: Vec<_> = (0..30)
        .map(|i| {
            let synth = synth.clone();
            let req = request(i);
            tokio::spawn(async move {
                if i % 3 == 0 {
                    let stream = match synth.synthesize(req.streaming(true)).await.unwrap() {
                        Synthesis::Stream(s) => s,
                        Synthesis::Clip(_) => unreachable!(),
                    };
                    stream.collect_clip().await.unwrap()
                } else {
                    synth.synthesize_clip(req).await.unwrap()
                }
            })
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let clip = handle.await.unwrap();
        assert!(!clip.samples.is_empty());
        assert_eq!(clip, expected[i], "request {i} differs from its sequential run");
    }
    wait_for_idle(&synth).await;
}

#[tokio::test]
async fn cancelling_a_stream_stops_work_and_frees_the_slot() {
    let config = PipelineConfig {
        window_tokens: 10,
        window_growth: 0,
        max_window_tokens: 10,
        lookahead_tokens: 0,
        channel_capacity: 1,
        ..Default::default()
    };
    let pulled = Arc::new(AtomicUsize::new(0));
    let mut stages = Stages::builtin(&config);
    stages.lm = Arc::new(FixedCountLm { total: 50, pulled: pulled.clone() });
    let synth = synthesizer_with(config, stages).await;

    let mut stream = synth
        .synthesize_stream(SynthesisRequest::new("Hello world", fixed("spk_A")))
        .await
        .unwrap();
    let first = stream.next_chunk().await.unwrap().unwrap();
    let second = stream.next_chunk().await.unwrap().unwrap();
    assert_eq!((first.index, second.index), (0, 1));
    assert!(!first.samples.is_empty());

    stream.cancel();
    assert!(stream.is_cancelled());
    assert!(stream.next_chunk().await.is_none());

    wait_for_idle(&synth).await;
    // five windows of ten would need all fifty tokens
    assert!(pulled.load(Ordering::SeqCst) < 50);
}

#[tokio::test]
async fn dropping_a_stream_frees_the_slot() {
    let synth = synthesizer(PipelineConfig { channel_capacity: 1, ..Default::default() }).await;
    let text = "A fairly long request that will produce several chunks. ".repeat(3);
    let mut stream = synth
        .synthesize_stream(SynthesisRequest::new(text, fixed("spk_A")))
        .await
        .unwrap();
    stream.next_chunk().await.unwrap().unwrap();
    drop(stream);
    wait_for_idle(&synth).await;
}

#[tokio::test]
async fn invalid_mode_combinations_run_no_stage() {
    let err = SynthesisMode::from_parts(ModeKind::ZeroShot, None, None, None).unwrap_err();
    assert!(matches!(err, SynthesisError::InvalidRequest { mode: ModeKind::ZeroShot, .. }));

    let config = PipelineConfig::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let stages = counted_stages(&config, calls.clone());
    let synth = synthesizer_with(config, stages).await;

    let mode = SynthesisMode::Instruct {
        speaker: SpeakerRef::Registered("spk_A".into()),
        instruction: "   ".into(),
    };
    let err = synth
        .synthesize_clip(SynthesisRequest::new("Say this.", mode))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    assert_eq!(err.stage, Stage::Validate);
    assert_eq!(err.mode, ModeKind::Instruct);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn text_over_the_hard_cap_fails_before_any_stage() {
    let config = PipelineConfig { max_text_chars: 100, ..Default::default() };
    let calls = Arc::new(AtomicUsize::new(0));
    let stages = counted_stages(&config, calls.clone());
    let synth = synthesizer_with(config, stages).await;

    let err = synth
        .synthesize_clip(SynthesisRequest::new("word ".repeat(30), fixed("spk_A")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    assert_eq!(err.stage, Stage::Validate);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(synth.available_slots(), synth.config().max_concurrent_requests);
}

#[tokio::test]
async fn unknown_speaker_is_not_found() {
    let synth = synthesizer(PipelineConfig::default()).await;
    let err = synth
        .synthesize_clip(SynthesisRequest::new("Who is this?", fixed("spk_Z")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(err.stage, Stage::ResolveSpeaker);
}

#[tokio::test]
async fn slow_decoder_times_out() {
    let config = PipelineConfig { stage_timeout_ms: 50, ..Default::default() };
    let mut stages = Stages::builtin(&config);
    stages.decoder = Arc::new(SlowDecoder {
        inner: FlowDecoder::new(&config),
        delay: Duration::from_millis(300),
    });
    let synth = synthesizer_with(config, stages).await;

    let err = synth
        .synthesize_clip(SynthesisRequest::new("This will not finish in time.", fixed("spk_A")))
        .await
        .unwrap_err();
    assert_eq!(err.stage, Stage::Decode);
    assert!(matches!(err.source, SynthesisError::Timeout { stage: Stage::Decode, .. }));
    wait_for_idle(&synth).await;
}

#[tokio::test]
async fn generation_failure_carries_context() {
    let config = PipelineConfig::default();
    let mut stages = Stages::builtin(&config);
    stages.lm = Arc::new(FailingLm);
    let synth = synthesizer_with(config, stages).await;

    let text = "An utterance long enough that the excerpt gets cut somewhere before the end.";
    let err = synth
        .synthesize_clip(SynthesisRequest::new(text, fixed("spk_A")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Generation);
    assert_eq!(err.stage, Stage::Generate);
    assert_eq!(err.mode, ModeKind::FixedSpeaker);
    assert!(err.excerpt.starts_with("An utterance long enough"));
    assert!(err.excerpt.ends_with("..."));
    assert!(err.to_string().contains("sampler diverged"));
}

#[tokio::test]
async fn streaming_failure_is_delivered_in_band() {
    let config = PipelineConfig::default();
    let mut stages = Stages::builtin(&config);
    stages.lm = Arc::new(FailingLm);
    let synth = synthesizer_with(config, stages).await;

    let mut stream = synth
        .synthesize_stream(SynthesisRequest::new("Fails once streaming starts.", fixed("spk_A")))
        .await
        .unwrap();
    let err = stream.next_chunk().await.unwrap().unwrap_err();
    assert_eq!(err.stage, Stage::Generate);
    assert!(stream.next_chunk().await.is_none());
    wait_for_idle(&synth).await;
}

#[tokio::test]
async fn zero_shot_reference_can_be_registered() {
    let synth = synthesizer(PipelineConfig::default()).await;
    let reference = ReferenceClip::new(voice_clip(180.0, 3.0))
        .with_prompt_text("this is how I sound")
        .register_as("guest", false);
    let mode = SynthesisMode::ZeroShot { speaker: SpeakerRef::Reference(reference) };

    let clip = synth
        .synthesize_clip(SynthesisRequest::new("Now say something new.", mode))
        .await
        .unwrap();
    assert!(!clip.samples.is_empty());

    let profile = synth.registry().lookup("guest").unwrap();
    assert_eq!(profile.prompt_text.as_deref(), Some("this is how I sound"));
    assert!(!profile.prompt_tokens.is_empty());

    let again = synth
        .synthesize_clip(SynthesisRequest::new("Registered voice.", fixed("guest")))
        .await
        .unwrap();
    assert!(!again.samples.is_empty());
}

#[tokio::test]
async fn registering_over_an_existing_id_fails() {
    let synth = synthesizer(PipelineConfig::default()).await;
    let reference = ReferenceClip::new(voice_clip(180.0, 2.0))
        .with_prompt_text("hello there")
        .register_as("spk_A", false);
    let err = synth
        .synthesize_clip(SynthesisRequest::new(
            "Taken.",
            SynthesisMode::ZeroShot { speaker: SpeakerRef::Reference(reference) },
        ))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    assert_eq!(err.stage, Stage::ResolveSpeaker);
}

#[tokio::test]
async fn low_rate_reference_is_invalid_audio() {
    let synth = synthesizer(PipelineConfig::default()).await;
    let clip = AudioClip::new(vec![0.2; 8_000 * 2], 8_000);
    let mode = SynthesisMode::ZeroShot { speaker: SpeakerRef::Reference(ReferenceClip::new(clip)) };
    let err = synth
        .synthesize_clip(SynthesisRequest::new("Narrowband.", mode))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidAudio);
}

#[tokio::test]
async fn reference_embedding_is_cached() {
    let synth = synthesizer(PipelineConfig::default()).await;
    let reference = ReferenceClip::new(voice_clip(200.0, 2.0)).with_prompt_text("cached voice");
    for _ in 0..2 {
        let mode = SynthesisMode::CrossLingual { speaker: SpeakerRef::Reference(reference.clone()) };
        synth
            .synthesize_clip(SynthesisRequest::new("Bonjour tout le monde.", mode).language(Language::En))
            .await
            .unwrap();
    }
    let stats = synth.cache_stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.entries, 1);
}

#[tokio::test]
async fn every_mode_produces_audio() {
    let synth = synthesizer(PipelineConfig::default()).await;
    let text = "One sentence for every mode.";
    let modes = vec![
        fixed("spk_A"),
        SynthesisMode::ZeroShot { speaker: SpeakerRef::Registered("spk_B".into()) },
        SynthesisMode::CrossLingual { speaker: SpeakerRef::Registered("spk_B".into()) },
        SynthesisMode::Instruct {
            speaker: SpeakerRef::Registered("spk_A".into()),
            instruction: "speak slowly and calmly".into(),
        },
    ];
    let mut outputs = Vec::new();
    for mode in modes {
        let clip = synth
            .synthesize_clip(SynthesisRequest::new(text, mode).language(Language::En))
            .await
            .unwrap();
        assert!(!clip.samples.is_empty());
        outputs.push(clip.samples);
    }
    // conditioning differs per mode
    assert_ne!(outputs[0], outputs[3]);
    assert_ne!(outputs[1], outputs[2]);
}

struct EchoTranscriber;

#[async_trait]
impl Transcriber for EchoTranscriber {
    async fn transcribe(&self, clip: &AudioClip) -> speech_core::Result<String> {
        Ok(format!("{} samples of speech", clip.samples.len()))
    }
}

#[tokio::test]
async fn transcriber_fills_missing_prompt_text() {
    let synth = synthesizer(PipelineConfig::default())
        .await
        .with_transcriber(Arc::new(EchoTranscriber));
    assert!(synth.has_transcriber());

    let reference = ReferenceClip::new(voice_clip(160.0, 2.0)).register_as("auto", false);
    let mode = SynthesisMode::ZeroShot { speaker: SpeakerRef::Reference(reference) };
    synth
        .synthesize_clip(SynthesisRequest::new("Transcribed prompt.", mode))
        .await
        .unwrap();
    let profile = synth.registry().lookup("auto").unwrap();
    assert_eq!(profile.prompt_text.as_deref(), Some("32000 samples of speech"));
}

#[tokio::test]
async fn enroll_speaker_rejects_duplicates() {
    let synth = synthesizer(PipelineConfig::default()).await;
    let profile = synth
        .enroll_speaker("spk_C", voice_clip(300.0, 1.5), None, false)
        .await
        .unwrap();
    assert_eq!(profile.id, "spk_C");
    assert!(synth.registry().contains("spk_C"));

    let err = synth
        .enroll_speaker("spk_C", voice_clip(300.0, 1.5), None, false)
        .await
        .unwrap_err();
    assert!(matches!(err, SynthesisError::AlreadyExists(_)));

    synth
        .enroll_speaker("spk_C", voice_clip(250.0, 1.5), Some("replaced".into()), true)
        .await
        .unwrap();
    assert_eq!(synth.registry().lookup("spk_C").unwrap().prompt_text.as_deref(), Some("replaced"));
}
