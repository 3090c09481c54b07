#![cfg(unix)]

mod support;

use std::fs;
use std::time::Duration;

use serial_test::serial;
use support::{
    FFMPEG_X264_FAILS, FakeTools, collect, job_started_ids, process_alive, wait_for, wait_for_pid,
};
use vidconvert_core::AppConfig;
use vidconvert_core::error::AppError;
use vidconvert_core::job::{EncodingStep, JobStatus};
use vidconvert_core::queue::{QueueEvent, QueueProcessor, QueueState};
use vidconvert_core::tools::Tool;

fn job_completed(events: &[QueueEvent]) -> Vec<(u64, JobStatus, f64)> {
    events
        .iter()
        .filter_map(|e| match e {
            QueueEvent::JobCompleted {
                job_id,
                status,
                queue_percent,
                ..
            } => Some((*job_id, *status, *queue_percent)),
            _ => None,
        })
        .collect()
}

fn last(events: &[QueueEvent]) -> &QueueEvent {
    events.last().expect("at least one event")
}

#[test]
#[serial]
fn failed_video_encode_stops_the_job_and_the_queue_moves_on() {
    let env = FakeTools::new();
    env.script(Tool::Ffmpeg, FFMPEG_X264_FAILS);
    let queue = QueueProcessor::new(env.config.clone());

    let events = collect(queue.start(vec![env.job("first"), env.copy_job("second")]).expect("start"));
    let jobs = queue.wait().expect("wait");

    let started: Vec<(u64, EncodingStep, usize, usize)> = events
        .iter()
        .filter_map(|e| match e {
            QueueEvent::StepStarted {
                job_id,
                step,
                number,
                total,
                ..
            } => Some((*job_id, *step, *number, *total)),
            _ => None,
        })
        .collect();
    assert_eq!(
        started,
        vec![
            (1, EncodingStep::Demux, 1, 4),
            (1, EncodingStep::EncodeVideo, 2, 4),
            (2, EncodingStep::Demux, 1, 3),
            (2, EncodingStep::EncodeAudio, 2, 3),
            (2, EncodingStep::MuxResult, 3, 3),
        ]
    );

    let first = &jobs[0];
    assert_eq!(first.status, JobStatus::Failed);
    assert_eq!(first.exit_code, 1);
    assert_eq!(first.completed_step, EncodingStep::Demux);
    assert_eq!(first.next_step, EncodingStep::EncodeVideo);
    let error = first.error.as_deref().expect("error message");
    assert!(error.contains("Conversion failed!"), "{}", error);

    let second = &jobs[1];
    assert_eq!(second.status, JobStatus::Completed);
    assert_eq!(second.completed_step, EncodingStep::Done);
    assert!(second.output_file.is_file());

    assert_eq!(
        last(&events),
        &QueueEvent::QueueCompleted {
            stopped: false,
            completed: 1,
            failed: 1,
            cancelled: 0,
        }
    );
    assert_eq!(queue.state(), QueueState::Idle);
}

#[test]
#[serial]
fn queue_percent_reaches_k_over_m_after_each_job() {
    let env = FakeTools::new();
    let queue = QueueProcessor::new(env.config.clone());
    let jobs = vec![env.copy_job("a"), env.copy_job("b"), env.copy_job("c")];

    let events = collect(queue.start(jobs).expect("start"));
    queue.wait().expect("wait");

    let completed = job_completed(&events);
    assert_eq!(completed.len(), 3);
    for (k, (job_id, status, percent)) in completed.iter().enumerate() {
        assert_eq!(*job_id, k as u64 + 1);
        assert_eq!(*status, JobStatus::Completed);
        let expected = (k + 1) as f64 / 3.0 * 100.0;
        assert!((percent - expected).abs() < 1e-6, "{} != {}", percent, expected);
    }

    let mut last_queue = 0.0;
    for event in &events {
        if let QueueEvent::Progress(p) = event {
            assert!((0.0..=100.0).contains(&p.job_percent));
            assert!(p.queue_percent >= last_queue, "queue percent went backwards");
            last_queue = p.queue_percent;
        }
    }
}

#[test]
#[serial]
fn stop_cancels_the_running_job_and_leaves_the_rest_queued() {
    let env = FakeTools::new();
    let pid_file = env.path("encoder.pid");
    env.script(
        Tool::Ffmpeg,
        &format!(
            "case \"$*\" in\n  *libx264*) echo $$ > '{}'; exec sleep 30;;\nesac\nexit 0",
            pid_file.display()
        ),
    );
    let queue = QueueProcessor::new(env.config.clone());
    let events = queue.start(vec![env.job("first"), env.job("second")]).expect("start");

    let mut seen = wait_for(&events, |e| {
        matches!(e, QueueEvent::StepStarted { job_id: 1, number: 2, .. })
    });
    let pid = wait_for_pid(&pid_file, Duration::from_secs(10)).expect("encoder wrote its pid");
    assert!(process_alive(&pid));
    queue.stop();
    assert!(!process_alive(&pid), "encoder {} survived stop", pid.trim());
    seen.extend(events.iter());
    let jobs = queue.wait().expect("wait");

    assert_eq!(job_started_ids(&seen), vec![1]);
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].status, JobStatus::Cancelled);
    assert_eq!(jobs[0].completed_step, EncodingStep::Demux);
    assert_eq!(jobs[1].status, JobStatus::Queued);
    assert_eq!(jobs[1].completed_step, EncodingStep::NotSet);
    assert_eq!(
        last(&seen),
        &QueueEvent::QueueCompleted {
            stopped: true,
            completed: 0,
            failed: 0,
            cancelled: 1,
        }
    );
    assert_eq!(queue.state(), QueueState::Stopped);
}

#[test]
#[serial]
fn second_start_while_processing_is_rejected() {
    let env = FakeTools::new();
    env.script(Tool::Ffmpeg, "exec sleep 30");
    let queue = QueueProcessor::new(env.config.clone());
    let events = queue.start(vec![env.copy_job("slow")]).expect("start");

    let err = queue.start(vec![env.copy_job("other")]).expect_err("second start");
    assert!(matches!(err, AppError::AlreadyRunning(_)));

    queue.stop();
    let events = collect(events);
    queue.wait().expect("wait");
    assert!(matches!(last(&events), QueueEvent::QueueCompleted { stopped: true, .. }));

    // a finished queue can be started again
    env.script(Tool::Ffmpeg, support::FFMPEG_OK);
    let events = collect(queue.start(vec![env.copy_job("again")]).expect("restart"));
    queue.wait().expect("wait");
    assert!(matches!(
        last(&events),
        QueueEvent::QueueCompleted { stopped: false, completed: 1, .. }
    ));
}

#[test]
#[serial]
fn delete_flags_apply_to_completed_and_failed_jobs_separately() {
    let env = FakeTools::new();
    env.script(Tool::Ffmpeg, FFMPEG_X264_FAILS);
    let config = AppConfig {
        delete_completed_jobs: Some(true),
        delete_failed_jobs: Some(false),
        ..env.config.clone()
    };
    let queue = QueueProcessor::new(config);

    let events = collect(queue.start(vec![env.job("fails"), env.copy_job("works")]).expect("start"));
    let jobs = queue.wait().expect("wait");

    let removed: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            QueueEvent::JobRemoved { job_id } => Some(*job_id),
            _ => None,
        })
        .collect();
    assert_eq!(removed, vec![2]);
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, 1);
    assert_eq!(jobs[0].status, JobStatus::Failed);
}

#[test]
#[serial]
fn halt_on_error_leaves_later_jobs_untouched() {
    let env = FakeTools::new();
    env.script(Tool::Ffmpeg, FFMPEG_X264_FAILS);
    let config = AppConfig {
        halt_on_error: Some(true),
        ..env.config.clone()
    };
    let queue = QueueProcessor::new(config);

    let events = collect(queue.start(vec![env.job("fails"), env.copy_job("works")]).expect("start"));
    let jobs = queue.wait().expect("wait");

    assert_eq!(job_started_ids(&events), vec![1]);
    assert_eq!(jobs[0].status, JobStatus::Failed);
    assert_eq!(jobs[1].status, JobStatus::Queued);
    assert_eq!(
        last(&events),
        &QueueEvent::QueueCompleted {
            stopped: true,
            completed: 0,
            failed: 1,
            cancelled: 0,
        }
    );
    assert_eq!(queue.state(), QueueState::Idle);
}

#[test]
#[serial]
fn missing_tool_fails_the_job_before_any_step_runs() {
    let env = FakeTools::new();
    env.remove(Tool::MkvMerge);
    let queue = QueueProcessor::new(env.config.clone());

    let events = collect(queue.start(vec![env.job("no-muxer")]).expect("start"));
    let jobs = queue.wait().expect("wait");

    assert!(!events.iter().any(|e| matches!(e, QueueEvent::StepStarted { .. })));
    assert!(events.iter().any(|e| matches!(e, QueueEvent::JobStarted { steps: 0, .. })));
    let job = &jobs[0];
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.exit_code, -1);
    assert_eq!(job.completed_step, EncodingStep::NotSet);
    let error = job.error.as_deref().expect("error message");
    assert!(error.contains("mkvmerge is required"), "{}", error);
}

#[test]
#[serial]
fn temp_output_is_moved_into_place() {
    let env = FakeTools::new();
    let queue = QueueProcessor::new(env.config.clone());
    let staging = env.path("tmp/staging.mkv");
    let mut job = env.copy_job("moved");
    job.temp_output = Some(staging.clone());
    let output = job.output_file.clone();

    collect(queue.start(vec![job]).expect("start"));
    let jobs = queue.wait().expect("wait");

    assert_eq!(jobs[0].status, JobStatus::Completed);
    assert_eq!(jobs[0].completed_step, EncodingStep::Done);
    assert!(output.is_file());
    assert!(!staging.exists());
}

#[test]
#[serial]
fn intermediate_files_are_removed_unless_disabled() {
    let env = FakeTools::new();
    let tmp = env.path("tmp");
    // touch every output the fake tools are pointed at inside the temp dir
    let touch = format!(
        "for a in \"$@\"; do case \"$a\" in '{}'/*) : > \"$a\";; esac; done\nexit 0",
        tmp.display()
    );
    env.script(Tool::Ffmpeg, &touch);

    let queue = QueueProcessor::new(env.config.clone());
    collect(queue.start(vec![env.copy_job("clean")]).expect("start"));
    let jobs = queue.wait().expect("wait");
    assert_eq!(jobs[0].status, JobStatus::Completed);
    assert!(jobs[0].temp_files.is_empty());
    let leftovers: Vec<_> = fs::read_dir(&tmp)
        .expect("read tmp")
        .filter_map(Result::ok)
        .filter(|e| e.path().is_file())
        .map(|e| e.path())
        .collect();
    assert!(leftovers.is_empty(), "{:?}", leftovers);

    let config = AppConfig {
        delete_temporary_files: Some(false),
        ..env.config.clone()
    };
    let queue = QueueProcessor::new(config);
    collect(queue.start(vec![env.copy_job("kept")]).expect("start"));
    let jobs = queue.wait().expect("wait");
    assert!(!jobs[0].temp_files.is_empty());
    assert!(jobs[0].temp_files.iter().any(|p| p.is_file()));
}
