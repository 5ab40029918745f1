use std::collections::HashSet;
use std::env;
use std::str::FromStr;

use futures::future::join_all;
use snafu::{OptionExt, ResultExt, Snafu, ensure};

use sahr_storage::{
    ChatStore, MessageId, NewMessage, NewSession, SESSION_ID_PREFIX, Sender, SessionId,
    SqliteChatStore, StorageError,
};

const BURST_SIZE: usize = 25;

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
    db_path: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    IdRoundtrip,
    IdInvalid,
    SchemaInit,
    FkViolation,
    UnreadAccounting,
    MessageOrdering,
    RegisterOverwrite,
    ReadAckIdempotent,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "id_roundtrip" => Some(Self::IdRoundtrip),
            "id_invalid" => Some(Self::IdInvalid),
            "schema_init" => Some(Self::SchemaInit),
            "fk_violation" => Some(Self::FkViolation),
            "unread_accounting" => Some(Self::UnreadAccounting),
            "message_ordering" => Some(Self::MessageOrdering),
            "register_overwrite" => Some(Self::RegisterOverwrite),
            "read_ack_idempotent" => Some(Self::ReadAckIdempotent),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::IdRoundtrip => "id_roundtrip",
            Self::IdInvalid => "id_invalid",
            Self::SchemaInit => "schema_init",
            Self::FkViolation => "fk_violation",
            Self::UnreadAccounting => "unread_accounting",
            Self::MessageOrdering => "message_ordering",
            Self::RegisterOverwrite => "register_overwrite",
            Self::ReadAckIdempotent => "read_ack_idempotent",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("missing required --scenario argument"))]
    MissingScenario { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown scenario '{raw}'"))]
    UnknownScenario { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("chat store validation failed: {source}"))]
    StorageValidation {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("missing required --db argument for scenario '{scenario}'"))]
    MissingDbPath {
        stage: &'static str,
        scenario: &'static str,
    },
    #[snafu(display("sqlite query failed: {source}"))]
    SqliteQuery {
        stage: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt::init();

    if let Err(error) = run().await {
        println!("runner_ok=false");
        eprintln!("runner_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> RunnerResult<()> {
    let args = parse_args(env::args().skip(1))?;
    println!("scenario={}", args.scenario.name());
    if let Some(db_path) = args.db_path.as_deref() {
        println!("db_path={db_path}");
    }

    match args.scenario {
        Scenario::IdRoundtrip => run_id_roundtrip(),
        Scenario::IdInvalid => run_id_invalid(),
        Scenario::SchemaInit => run_schema_init(require_db_path(&args, "schema_init")?).await,
        Scenario::FkViolation => run_fk_violation(require_db_path(&args, "fk_violation")?).await,
        Scenario::UnreadAccounting => {
            run_unread_accounting(require_db_path(&args, "unread_accounting")?).await
        }
        Scenario::MessageOrdering => {
            run_message_ordering(require_db_path(&args, "message_ordering")?).await
        }
        Scenario::RegisterOverwrite => {
            run_register_overwrite(require_db_path(&args, "register_overwrite")?).await
        }
        Scenario::ReadAckIdempotent => {
            run_read_ack_idempotent(require_db_path(&args, "read_ack_idempotent")?).await
        }
        Scenario::All => run_all(args.db_path.as_deref()).await,
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut db_path = None;
    let mut pending = args.into_iter();

    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--scenario" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-scenario-value",
                    arg: "--scenario",
                })?;

                let parsed = Scenario::parse(&value).context(UnknownScenarioSnafu {
                    stage: "parse-args-scenario",
                    raw: value,
                })?;
                scenario = Some(parsed);
            }
            "--db" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-db-value",
                    arg: "--db",
                })?;
                db_path = Some(value);
            }
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        }
    }

    Ok(RunnerArgs {
        scenario: scenario.context(MissingScenarioSnafu {
            stage: "parse-args-scenario-required",
        })?,
        db_path,
    })
}

fn run_id_roundtrip() -> RunnerResult<()> {
    let session_id = SessionId::generate();
    ensure!(
        session_id.as_str().starts_with(SESSION_ID_PREFIX),
        ScenarioFailedSnafu {
            stage: "scenario-id-roundtrip-prefix",
            scenario: "id_roundtrip",
            reason: format!("generated session id '{session_id}' lacks the expected prefix"),
        }
    );
    assert_id_roundtrip("session_id", session_id)?;
    assert_id_roundtrip("message_id", MessageId::new_v7())?;
    println!("id_roundtrip=true");
    println!("runner_ok=true");
    Ok(())
}

fn run_id_invalid() -> RunnerResult<()> {
    let message_id_rejected = matches!(
        "not-a-valid-uuid".parse::<MessageId>(),
        Err(StorageError::InvalidId { .. })
    );
    let session_id_rejected = ["", "chats/other", "session id"].iter().all(|raw| {
        matches!(
            raw.parse::<SessionId>(),
            Err(StorageError::MalformedSessionId { .. })
        )
    });

    let invalid_id_error = message_id_rejected && session_id_rejected;
    println!("invalid_id_error={invalid_id_error}");
    ensure!(
        invalid_id_error,
        ScenarioFailedSnafu {
            stage: "scenario-id-invalid",
            scenario: "id_invalid",
            reason: "at least one id wrapper accepted malformed input".to_string(),
        }
    );

    println!("runner_ok=true");
    Ok(())
}

async fn run_all(db_path: Option<&str>) -> RunnerResult<()> {
    run_id_roundtrip()?;
    run_id_invalid()?;

    if let Some(path) = db_path {
        run_schema_init(path).await?;
        run_fk_violation(path).await?;
        run_unread_accounting(path).await?;
        run_message_ordering(path).await?;
        run_register_overwrite(path).await?;
        run_read_ack_idempotent(path).await?;
    }

    println!("all_passed=true");
    Ok(())
}

async fn run_schema_init(db_path: &str) -> RunnerResult<()> {
    let store = open_store(db_path, "scenario-schema-init-open").await?;
    let pool = store.pool();

    let discovered_tables = sqlx::query_scalar::<_, String>(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('chat_sessions', 'chat_messages')",
    )
    .fetch_all(pool)
    .await
    .context(SqliteQuerySnafu {
        stage: "scenario-schema-init-list-tables",
    })?;
    let available_tables: HashSet<String> = discovered_tables.into_iter().collect();
    let schema_ok = ["chat_sessions", "chat_messages"]
        .iter()
        .all(|table_name| available_tables.contains(*table_name));

    let journal_mode = sqlx::query_scalar::<_, String>("PRAGMA journal_mode;")
        .fetch_one(pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "scenario-schema-init-journal-mode",
        })?
        .to_lowercase();
    let foreign_keys = sqlx::query_scalar::<_, i64>("PRAGMA foreign_keys;")
        .fetch_one(pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "scenario-schema-init-foreign-keys",
        })?;

    println!("schema_ok={schema_ok}");
    println!("journal_mode={journal_mode}");
    println!("foreign_keys={foreign_keys}");

    ensure!(
        schema_ok,
        ScenarioFailedSnafu {
            stage: "scenario-schema-init-assert-schema",
            scenario: "schema_init",
            reason: "expected chat tables are missing".to_string(),
        }
    );
    ensure!(
        journal_mode == "wal",
        ScenarioFailedSnafu {
            stage: "scenario-schema-init-assert-journal-mode",
            scenario: "schema_init",
            reason: format!("expected journal_mode=wal but was {journal_mode}"),
        }
    );
    ensure!(
        foreign_keys == 1,
        ScenarioFailedSnafu {
            stage: "scenario-schema-init-assert-foreign-keys",
            scenario: "schema_init",
            reason: format!("expected foreign_keys=1 but was {foreign_keys}"),
        }
    );

    println!("runner_ok=true");
    Ok(())
}

async fn run_fk_violation(db_path: &str) -> RunnerResult<()> {
    let store = open_store(db_path, "scenario-fk-violation-open").await?;

    let insert_result = sqlx::query(
        "INSERT INTO chat_messages (id, session_id, seq, sender, text, image_url, reply_to, timestamp_ms, is_read) VALUES (?, ?, 1, 'user', 'orphan-row', NULL, NULL, 0, 0)",
    )
    .bind(MessageId::new_v7().to_string())
    .bind(SessionId::generate().to_string())
    .execute(store.pool())
    .await;

    let fk_violation_blocked = match insert_result {
        Ok(_) => false,
        Err(error) if is_foreign_key_violation(&error) => true,
        Err(error) => {
            return ScenarioFailedSnafu {
                stage: "scenario-fk-violation-insert",
                scenario: "fk_violation",
                reason: format!("unexpected sqlite error while testing FK guard: {error}"),
            }
            .fail();
        }
    };

    println!("fk_violation_blocked={fk_violation_blocked}");
    ensure!(
        fk_violation_blocked,
        ScenarioFailedSnafu {
            stage: "scenario-fk-violation-assert",
            scenario: "fk_violation",
            reason: "orphan message insert unexpectedly succeeded".to_string(),
        }
    );

    println!("runner_ok=true");
    Ok(())
}

async fn run_unread_accounting(db_path: &str) -> RunnerResult<()> {
    let store = open_store(db_path, "scenario-unread-open").await?;
    let session_id = register(&store, "Burst", "scenario-unread-register").await?;

    let sends = (0..BURST_SIZE).map(|index| {
        store.append_message(
            &session_id,
            NewMessage::text(Sender::Visitor, format!("burst {index}")),
        )
    });
    for result in join_all(sends).await {
        result.context(StorageValidationSnafu {
            stage: "scenario-unread-append",
        })?;
    }

    let unread_count = load_session(&store, &session_id, "scenario-unread-load")
        .await?
        .unread_count;
    println!("unread_count={unread_count}");
    ensure!(
        unread_count as usize == BURST_SIZE,
        ScenarioFailedSnafu {
            stage: "scenario-unread-assert-count",
            scenario: "unread_accounting",
            reason: format!("expected {BURST_SIZE} unread after burst but was {unread_count}"),
        }
    );

    store
        .append_message(&session_id, NewMessage::text(Sender::Admin, "on it"))
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-unread-admin-reply",
        })?;
    let after_reply = load_session(&store, &session_id, "scenario-unread-load-after-reply")
        .await?
        .unread_count;
    println!("unread_after_reply={after_reply}");
    ensure!(
        after_reply == 0,
        ScenarioFailedSnafu {
            stage: "scenario-unread-assert-reply",
            scenario: "unread_accounting",
            reason: format!("admin reply left unread_count at {after_reply}"),
        }
    );

    println!("runner_ok=true");
    Ok(())
}

async fn run_message_ordering(db_path: &str) -> RunnerResult<()> {
    let store = open_store(db_path, "scenario-ordering-open").await?;
    let session_id = register(&store, "Order", "scenario-ordering-register").await?;

    let script = [
        (Sender::Visitor, "hello"),
        (Sender::Admin, "hi there"),
        (Sender::Visitor, "which lens?"),
        (Sender::Admin, "35mm"),
    ];
    for (sender, text) in script {
        store
            .append_message(&session_id, NewMessage::text(sender, text))
            .await
            .context(StorageValidationSnafu {
                stage: "scenario-ordering-append",
            })?;
    }

    let messages = store
        .list_messages(&session_id)
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-ordering-list",
        })?;
    let texts = messages
        .iter()
        .filter_map(|message| message.text.as_deref())
        .collect::<Vec<_>>();
    let expected = script.iter().map(|(_, text)| *text).collect::<Vec<_>>();
    let ordered = texts == expected
        && messages
            .windows(2)
            .all(|pair| pair[0].timestamp_ms <= pair[1].timestamp_ms && pair[0].seq < pair[1].seq);
    let session = load_session(&store, &session_id, "scenario-ordering-load").await?;
    let last_matches = session.last_message_at_ms == messages.last().map(|m| m.timestamp_ms);

    println!("messages_ordered={ordered}");
    println!("last_message_at_matches={last_matches}");
    ensure!(
        ordered && last_matches,
        ScenarioFailedSnafu {
            stage: "scenario-ordering-assert",
            scenario: "message_ordering",
            reason: format!("unexpected message order {texts:?}"),
        }
    );

    println!("runner_ok=true");
    Ok(())
}

async fn run_register_overwrite(db_path: &str) -> RunnerResult<()> {
    let store = open_store(db_path, "scenario-overwrite-open").await?;
    let session_id = register(&store, "First", "scenario-overwrite-register").await?;
    store
        .append_message(&session_id, NewMessage::text(Sender::Visitor, "kept"))
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-overwrite-append",
        })?;

    store
        .create_session(NewSession {
            id: session_id.clone(),
            user_name: "Second".to_string(),
            user_email: "second@example.com".to_string(),
        })
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-overwrite-reregister",
        })?;

    let session = load_session(&store, &session_id, "scenario-overwrite-load").await?;
    let kept_messages = store
        .list_messages(&session_id)
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-overwrite-list",
        })?
        .len();

    println!("user_name={}", session.user_name);
    println!("unread_count={}", session.unread_count);
    println!("kept_messages={kept_messages}");
    ensure!(
        session.user_name == "Second" && session.unread_count == 0 && kept_messages == 1,
        ScenarioFailedSnafu {
            stage: "scenario-overwrite-assert",
            scenario: "register_overwrite",
            reason: "re-registration did not overwrite the session document".to_string(),
        }
    );

    println!("runner_ok=true");
    Ok(())
}

async fn run_read_ack_idempotent(db_path: &str) -> RunnerResult<()> {
    let store = open_store(db_path, "scenario-read-ack-open").await?;
    let session_id = register(&store, "Reader", "scenario-read-ack-register").await?;
    for text in ["one", "two"] {
        store
            .append_message(&session_id, NewMessage::text(Sender::Visitor, text))
            .await
            .context(StorageValidationSnafu {
                stage: "scenario-read-ack-append",
            })?;
    }

    for _ in 0..2 {
        store
            .mark_read(&session_id)
            .await
            .context(StorageValidationSnafu {
                stage: "scenario-read-ack-mark",
            })?;
    }

    let session = load_session(&store, &session_id, "scenario-read-ack-load").await?;
    let all_read = store
        .list_messages(&session_id)
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-read-ack-list",
        })?
        .iter()
        .all(|message| message.read);

    println!("unread_count={}", session.unread_count);
    println!("all_read={all_read}");
    ensure!(
        session.unread_count == 0 && all_read,
        ScenarioFailedSnafu {
            stage: "scenario-read-ack-assert",
            scenario: "read_ack_idempotent",
            reason: "repeated read acknowledgment left unread state behind".to_string(),
        }
    );

    println!("runner_ok=true");
    Ok(())
}

async fn open_store(db_path: &str, stage: &'static str) -> RunnerResult<SqliteChatStore> {
    SqliteChatStore::open(db_path)
        .await
        .context(StorageValidationSnafu { stage })
}

async fn register(
    store: &SqliteChatStore,
    name: &str,
    stage: &'static str,
) -> RunnerResult<SessionId> {
    let session = store
        .create_session(NewSession {
            id: SessionId::generate(),
            user_name: name.to_string(),
            user_email: format!("{}@example.com", name.to_lowercase()),
        })
        .await
        .context(StorageValidationSnafu { stage })?;
    Ok(session.id)
}

async fn load_session(
    store: &SqliteChatStore,
    session_id: &SessionId,
    stage: &'static str,
) -> RunnerResult<sahr_storage::SessionRecord> {
    let session = store
        .get_session(session_id)
        .await
        .context(StorageValidationSnafu { stage })?;
    session.context(ScenarioFailedSnafu {
        stage,
        scenario: "load_session",
        reason: format!("session '{session_id}' disappeared"),
    })
}

fn assert_id_roundtrip<T>(label: &'static str, id: T) -> RunnerResult<()>
where
    T: Clone + Eq + FromStr<Err = StorageError> + std::fmt::Display,
{
    let encoded = id.to_string();
    let decoded = encoded.parse::<T>().context(StorageValidationSnafu {
        stage: "scenario-id-roundtrip-parse",
    })?;

    ensure!(
        decoded == id,
        ScenarioFailedSnafu {
            stage: "scenario-id-roundtrip-compare",
            scenario: "id_roundtrip",
            reason: format!("{label} parse/format roundtrip mismatch"),
        }
    );

    println!("{label}_roundtrip=true");
    Ok(())
}

fn require_db_path<'a>(args: &'a RunnerArgs, scenario: &'static str) -> RunnerResult<&'a str> {
    args.db_path.as_deref().context(MissingDbPathSnafu {
        stage: "require-db-path",
        scenario,
    })
}

fn is_foreign_key_violation(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(database_error) => {
            if let Some(code) = database_error.code()
                && code == "787"
            {
                return true;
            }

            database_error
                .message()
                .contains("FOREIGN KEY constraint failed")
        }
        _ => false,
    }
}
