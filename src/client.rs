//! Terminal front end for taking one exam against a running API.
//!
//! Reads commands from stdin, autosaves answers through the debouncer and keeps the countdown
//! synced in a background task until the attempt is submitted or closed by the server.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::core::config::Settings;
use crate::db::types::QuestionType;
use crate::schemas::session::{AnswerResponse, SessionResultResponse, SessionStateResponse};
use crate::services::answer_codec::AnswerValue;
use crate::services::countdown::{AnswerDebouncer, Countdown};
use crate::services::session_client::{
    run_time_sync, ClientError, SessionClient, SyncConfig, SyncOutcome,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const HELP: &str = "commands: <question_id> <answer> | saved | time | away | submit | quit
  choice answers are option ids separated by commas, e.g. `4 30,31`";

#[derive(Debug, Clone)]
pub(crate) struct ClientArgs {
    pub(crate) exam_id: String,
    pub(crate) base_url: String,
    pub(crate) token: String,
}

impl ClientArgs {
    /// `exam_client <exam_id> [--base-url URL] [--token TOKEN]`. The token falls back to
    /// `EXAM_CLIENT_TOKEN`; the base URL to `EXAM_CLIENT_BASE_URL`, then to the local server.
    pub(crate) fn parse(
        settings: &Settings,
        mut args: impl Iterator<Item = String>,
    ) -> Result<Self> {
        let mut exam_id = None;
        let mut base_url = env::var("EXAM_CLIENT_BASE_URL").ok();
        let mut token = env::var("EXAM_CLIENT_TOKEN").ok();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--base-url" => {
                    base_url =
                        Some(args.next().ok_or_else(|| anyhow!("--base-url missing value"))?);
                }
                "--token" => {
                    token = Some(args.next().ok_or_else(|| anyhow!("--token missing value"))?);
                }
                other if other.starts_with("--") => {
                    return Err(anyhow!("Unknown argument: {other}"));
                }
                _ if exam_id.is_none() => exam_id = Some(arg),
                _ => return Err(anyhow!("Unexpected argument: {arg}")),
            }
        }

        let base_url = base_url.unwrap_or_else(|| {
            format!(
                "http://127.0.0.1:{}{}/sessions",
                settings.server_port(),
                settings.api().api_v1_str
            )
        });

        Ok(Self {
            exam_id: exam_id.ok_or_else(|| anyhow!("usage: exam_client <exam_id>"))?,
            base_url,
            token: token
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| anyhow!("EXAM_CLIENT_TOKEN or --token is required"))?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Answer { question_id: i64, value: AnswerValue },
    Saved,
    Time,
    TabSwitch,
    Submit,
    Quit,
    Help,
}

impl Command {
    pub(crate) fn parse(line: &str, questions: &HashMap<i64, QuestionType>) -> Result<Self> {
        let line = line.trim();
        match line {
            "saved" => return Ok(Command::Saved),
            "time" => return Ok(Command::Time),
            "away" => return Ok(Command::TabSwitch),
            "submit" => return Ok(Command::Submit),
            "quit" | "exit" => return Ok(Command::Quit),
            "" | "help" | "?" => return Ok(Command::Help),
            _ => {}
        }

        let (id, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let question_id: i64 = id.parse().with_context(|| format!("unknown command `{id}`"))?;
        let question_type = questions
            .get(&question_id)
            .ok_or_else(|| anyhow!("question {question_id} is not part of this exam"))?;
        let rest = rest.trim();

        let value = if question_type.takes_text() {
            AnswerValue::Text(rest.to_string())
        } else {
            let ids = rest
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(|part| part.parse::<i64>())
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("expected option ids for question {question_id}"))?;
            AnswerValue::Options(ids)
        };

        Ok(Command::Answer { question_id, value })
    }
}

fn describe_answer(value: &AnswerValue) -> String {
    match value {
        AnswerValue::Text(text) => format!("\"{text}\""),
        AnswerValue::Options(ids) => {
            let ids: Vec<String> = ids.iter().map(i64::to_string).collect();
            format!("[{}]", ids.join(", "))
        }
    }
}

fn print_state(state: &SessionStateResponse) {
    println!("{} (attempt {})", state.exam.title, state.session.attempt_number);
    if let Some(description) = &state.exam.description {
        println!("{description}");
    }
    for question in &state.questions {
        println!("[{}] {} ({} marks)", question.id, question.content, question.marks);
        for option in &question.options {
            println!("    {}: {}", option.id, option.text);
        }
    }
    print_answers(&state.answers);
}

fn print_answers(answers: &[AnswerResponse]) {
    for answer in answers {
        println!(
            "  saved {} = {} at {}",
            answer.question_id,
            describe_answer(&answer.answer),
            answer.updated_at
        );
    }
}

fn print_result(result: &SessionResultResponse) {
    let session = &result.session;
    println!(
        "{}: {} ended {}",
        result.exam.title,
        session.status.as_str(),
        session.end_time.as_deref().unwrap_or("-")
    );
    println!(
        "score {:.2} / {:.2} ({:.2}%)",
        session.score.unwrap_or(0.0),
        result.exam.total_marks,
        session.percentage.unwrap_or(0.0)
    );
    for answer in &result.answers {
        let verdict = match answer.is_correct {
            Some(true) => "correct",
            Some(false) => "wrong",
            None => "ungraded",
        };
        println!(
            "  {}: {} {verdict} ({} marks)",
            answer.question_id,
            describe_answer(&answer.answer),
            answer.marks_awarded.unwrap_or(0.0)
        );
    }
    if let Some(passed) = result.passed {
        println!("{}", if passed { "passed" } else { "not passed" });
    }
    if result.flagged {
        println!("flagged for review: {} tab switches", session.tab_switch_count);
    }
}

async fn wait_until(deadline: Option<std::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

enum Ending {
    Closed,
    Left,
}

pub(crate) async fn run(settings: &Settings, args: ClientArgs) -> Result<()> {
    let config = SyncConfig::from_settings(settings.exam());
    let client = SessionClient::new(&args.base_url, args.token, REQUEST_TIMEOUT)?;

    let started = client.start(&args.exam_id).await?;
    let session_id = started.session_id;
    if started.resumed {
        println!("Resuming session {session_id}");
    }

    let state = client.state(&session_id).await?;
    let questions: HashMap<i64, QuestionType> =
        state.questions.iter().map(|question| (question.id, question.question_type)).collect();
    print_state(&state);

    let countdown = Countdown::new(state.remaining_seconds);
    println!("{} left ({} seconds). {HELP}", countdown.display(), countdown.remaining_seconds());

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut sync_task: JoinHandle<Result<SyncOutcome, ClientError>> = tokio::spawn({
        let client = client.clone();
        let session_id = session_id.clone();
        let mut countdown = countdown;
        async move { run_time_sync(&client, &session_id, &mut countdown, config, stop_rx).await }
    });

    let mut debouncer = AnswerDebouncer::new(config.debounce);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut sync_finished = false;

    let ending = loop {
        tokio::select! {
            joined = &mut sync_task => {
                sync_finished = true;
                match joined? {
                    Ok(SyncOutcome::AutoSubmitted) => println!("Time is up; answers submitted"),
                    Ok(SyncOutcome::ClosedByServer) => println!("The session was closed"),
                    Ok(SyncOutcome::Stopped) => {}
                    Err(err) => tracing::warn!(error = %err, "Time sync stopped"),
                }
                break Ending::Closed;
            }
            _ = wait_until(debouncer.next_due()) => {
                let now = std::time::Instant::now();
                match client.flush_due(&session_id, &mut debouncer, now).await {
                    Ok(saved) => tracing::debug!(saved, "Autosaved answers"),
                    Err(err) if err.is_closed() => {
                        println!("Answer not saved: {err}");
                        break Ending::Closed;
                    }
                    Err(err) => println!("Answer not saved: {err}"),
                }
            }
            _ = tokio::signal::ctrl_c() => break Ending::Left,
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break Ending::Left;
                };
                let command = match Command::parse(&line, &questions) {
                    Ok(command) => command,
                    Err(err) => {
                        println!("{err:#}");
                        continue;
                    }
                };
                match command {
                    Command::Answer { question_id, value } => {
                        debouncer.record(question_id, value, std::time::Instant::now());
                    }
                    Command::Saved => print_answers(&client.answers(&session_id).await?),
                    Command::Time => match client.remaining_time(&session_id).await {
                        Ok(poll) => {
                            let left = Countdown::new(poll.remaining_seconds);
                            println!("{} ({})", left.display(), left.urgency().as_str());
                        }
                        Err(err) if err.is_time_expired() => {
                            println!("Time is up");
                            break Ending::Closed;
                        }
                        Err(err) => println!("{err}"),
                    },
                    Command::TabSwitch => {
                        let status = client.tab_switch(&session_id).await?;
                        println!(
                            "tab switches: {}{}{}",
                            status.count,
                            if status.counted { "" } else { " (merged)" },
                            if status.flagged { ", flagged" } else { "" }
                        );
                    }
                    Command::Submit => {
                        match client.submit_with_pending(&session_id, &mut debouncer).await {
                            Ok(summary) => println!("Submitted as {}", summary.status.as_str()),
                            Err(err) if err.is_closed() => println!("The session was closed"),
                            Err(err) => return Err(err.into()),
                        }
                        break Ending::Closed;
                    }
                    Command::Quit => break Ending::Left,
                    Command::Help => println!("{HELP}"),
                }
            }
        }
    };

    // Push typed answers still waiting on the debounce before stopping.
    if matches!(ending, Ending::Left) && !debouncer.is_empty() {
        let cutoff = std::time::Instant::now() + config.debounce;
        if let Err(err) = client.flush_due(&session_id, &mut debouncer, cutoff).await {
            println!("Answer not saved: {err}");
        }
    }

    let _ = stop_tx.send(true);
    if !sync_finished {
        match sync_task.await? {
            Ok(SyncOutcome::AutoSubmitted) => println!("Time is up; answers submitted"),
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "Time sync stopped"),
        }
    }

    match ending {
        Ending::Closed => print_result(&client.result(&session_id).await?),
        Ending::Left => println!("Left session {session_id} open; run again to resume"),
    }

    Ok(())
}
