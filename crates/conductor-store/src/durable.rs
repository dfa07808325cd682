use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection};
use tracing::instrument;

use conductor_core::ids::{SessionId, TenantId};
use conductor_core::turns::{ConversationTurn, SessionKey, ToolCallMeta};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;
use crate::store::MemoryStore;

const TABLE: &str = "conversation_turns";

/// Authoritative store: one SQLite row per turn, keyed by (tenant, session).
#[derive(Clone)]
pub struct DurableStore {
    db: Database,
}

impl DurableStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Run SQLite work on the blocking pool so a slow disk never stalls a
    /// runtime worker.
    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Database) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| StoreError::Database(format!("blocking task failed: {e}")))?
    }

    /// Number of distinct sessions a tenant has history for.
    pub fn session_count(&self, tenant_id: &TenantId) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(DISTINCT session_id) FROM conversation_turns WHERE tenant_id = ?1",
                [tenant_id.as_str()],
                |row| row.get(0),
            )?;
            Ok(count.max(0) as u64)
        })
    }

    /// Sessions of a tenant, most recently active first.
    pub fn list_sessions(
        &self,
        tenant_id: &TenantId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<SessionId>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id FROM conversation_turns WHERE tenant_id = ?1
                 GROUP BY session_id
                 ORDER BY MAX(created_at) DESC, MAX(seq) DESC
                 LIMIT ?2 OFFSET ?3",
            )?;
            let rows = stmt
                .query_map(params![tenant_id.as_str(), limit, offset], |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows.into_iter().map(SessionId::from_raw).collect())
        })
    }
}

fn insert_turns(
    conn: &Connection,
    key: &SessionKey,
    turns: &[ConversationTurn],
) -> Result<(), StoreError> {
    let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
    let mut stmt = conn.prepare_cached(
        "INSERT INTO conversation_turns (tenant_id, session_id, role, content, tool_calls, turn_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    for turn in turns {
        let tool_calls = if turn.tool_calls.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&turn.tool_calls)?)
        };
        stmt.execute(params![
            key.tenant_id.as_str(),
            key.session_id.as_str(),
            turn.role.to_string(),
            turn.content,
            tool_calls,
            turn.timestamp.to_rfc3339(),
            created_at,
        ])?;
    }
    Ok(())
}

fn row_to_turn(row: &rusqlite::Row<'_>) -> Result<ConversationTurn, StoreError> {
    let role: String = row_helpers::get(row, 0, TABLE, "role")?;
    let content: String = row_helpers::get(row, 1, TABLE, "content")?;
    let tool_calls: Option<String> = row_helpers::get(row, 2, TABLE, "tool_calls")?;
    let turn_at: String = row_helpers::get(row, 3, TABLE, "turn_at")?;

    let tool_calls: Vec<ToolCallMeta> = match tool_calls {
        Some(raw) => row_helpers::parse_json(&raw, TABLE, "tool_calls")?,
        None => Vec::new(),
    };

    Ok(ConversationTurn {
        role: row_helpers::parse_enum(&role, TABLE, "role")?,
        content,
        tool_calls,
        timestamp: row_helpers::parse_timestamp(&turn_at, TABLE, "turn_at")?,
    })
}

fn query_turns(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<ConversationTurn>, StoreError> {
    let mut stmt = conn.prepare_cached(sql)?;
    let mut rows = stmt.query(params)?;
    let mut turns = Vec::new();
    while let Some(row) = rows.next()? {
        turns.push(row_to_turn(row)?);
    }
    Ok(turns)
}

#[async_trait]
impl MemoryStore for DurableStore {
    /// Delete and insert run in one transaction, so a failed write leaves the
    /// previous history intact.
    #[instrument(skip(self, turns), fields(session = %key, turns = turns.len()))]
    async fn write(&self, key: &SessionKey, turns: &[ConversationTurn]) -> Result<(), StoreError> {
        let key = key.clone();
        let turns = turns.to_vec();
        self.blocking(move |db| {
            db.with_transaction(|tx| {
                tx.execute(
                    "DELETE FROM conversation_turns WHERE tenant_id = ?1 AND session_id = ?2",
                    params![key.tenant_id.as_str(), key.session_id.as_str()],
                )?;
                insert_turns(tx, &key, &turns)
            })
        })
        .await
    }

    async fn read(&self, key: &SessionKey) -> Result<Vec<ConversationTurn>, StoreError> {
        let key = key.clone();
        self.blocking(move |db| {
            db.with_conn(|conn| {
                query_turns(
                    conn,
                    "SELECT role, content, tool_calls, turn_at FROM conversation_turns
                     WHERE tenant_id = ?1 AND session_id = ?2
                     ORDER BY created_at ASC, seq ASC",
                    params![key.tenant_id.as_str(), key.session_id.as_str()],
                )
            })
        })
        .await
    }

    async fn append(&self, key: &SessionKey, turns: &[ConversationTurn]) -> Result<(), StoreError> {
        if turns.is_empty() {
            return Ok(());
        }
        let key = key.clone();
        let turns = turns.to_vec();
        self.blocking(move |db| db.with_transaction(|tx| insert_turns(tx, &key, &turns)))
            .await
    }

    async fn delete(&self, key: &SessionKey) -> Result<(), StoreError> {
        let key = key.clone();
        self.blocking(move |db| {
            db.with_conn(|conn| {
                conn.execute(
                    "DELETE FROM conversation_turns WHERE tenant_id = ?1 AND session_id = ?2",
                    params![key.tenant_id.as_str(), key.session_id.as_str()],
                )?;
                Ok(())
            })
        })
        .await
    }

    async fn read_window(
        &self,
        key: &SessionKey,
        size: usize,
    ) -> Result<Vec<ConversationTurn>, StoreError> {
        let key = key.clone();
        let mut turns = self
            .blocking(move |db| {
                db.with_conn(|conn| {
                    query_turns(
                        conn,
                        "SELECT role, content, tool_calls, turn_at FROM conversation_turns
                         WHERE tenant_id = ?1 AND session_id = ?2
                         ORDER BY created_at DESC, seq DESC
                         LIMIT ?3",
                        params![key.tenant_id.as_str(), key.session_id.as_str(), size as i64],
                    )
                })
            })
            .await?;
        turns.reverse();
        Ok(turns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::turns::Role;

    fn setup() -> DurableStore {
        DurableStore::new(Database::in_memory().unwrap())
    }

    fn key(tenant: &str, session: &str) -> SessionKey {
        SessionKey::new(TenantId::from_raw(tenant), SessionId::from_raw(session))
    }

    fn contents(turns: &[ConversationTurn]) -> Vec<&str> {
        turns.iter().map(|t| t.content.as_str()).collect()
    }

    #[tokio::test]
    async fn append_preserves_insertion_order() {
        let store = setup();
        let k = key("t", "s");
        store
            .append(&k, &[ConversationTurn::user("q1"), ConversationTurn::assistant("a1")])
            .await
            .unwrap();
        store.append(&k, &[ConversationTurn::user("q2")]).await.unwrap();

        let turns = store.read(&k).await.unwrap();
        assert_eq!(contents(&turns), ["q1", "a1", "q2"]);
        assert_eq!(turns[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn write_replaces_history() {
        let store = setup();
        let k = key("t", "s");
        store.append(&k, &[ConversationTurn::user("old")]).await.unwrap();
        store
            .write(&k, &[ConversationTurn::system("sys"), ConversationTurn::assistant("summary")])
            .await
            .unwrap();
        assert_eq!(contents(&store.read(&k).await.unwrap()), ["sys", "summary"]);
    }

    #[tokio::test]
    async fn tool_calls_survive_storage() {
        let store = setup();
        let k = key("t", "s");
        let turn = ConversationTurn::assistant("checking").with_tool_calls(vec![ToolCallMeta {
            id: "c1".into(),
            name: "track_parcel".into(),
            arguments: serde_json::json!({"tracking": "SF123"}),
        }]);
        store.append(&k, &[turn.clone()]).await.unwrap();
        let read = store.read(&k).await.unwrap();
        assert_eq!(read[0].tool_calls, turn.tool_calls);
        assert_eq!(read[0].timestamp, turn.timestamp);
    }

    #[tokio::test]
    async fn sessions_scoped_by_tenant() {
        let store = setup();
        store.append(&key("acme", "s1"), &[ConversationTurn::user("a")]).await.unwrap();
        store.append(&key("globex", "s1"), &[ConversationTurn::user("g")]).await.unwrap();

        assert_eq!(contents(&store.read(&key("acme", "s1")).await.unwrap()), ["a"]);
        store.delete(&key("acme", "s1")).await.unwrap();
        assert!(store.read(&key("acme", "s1")).await.unwrap().is_empty());
        assert_eq!(store.read(&key("globex", "s1")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn read_window_returns_recent_oldest_first() {
        let store = setup();
        let k = key("t", "s");
        let turns: Vec<_> = (0..8).map(|i| ConversationTurn::user(format!("m{i}"))).collect();
        store.append(&k, &turns).await.unwrap();
        assert_eq!(contents(&store.read_window(&k, 3).await.unwrap()), ["m5", "m6", "m7"]);
        assert_eq!(store.read_window(&k, 50).await.unwrap().len(), 8);
    }

    #[tokio::test]
    async fn counts_and_lists_sessions() {
        let store = setup();
        let tenant = TenantId::from_raw("acme");
        store.append(&key("acme", "s1"), &[ConversationTurn::user("x")]).await.unwrap();
        store.append(&key("acme", "s2"), &[ConversationTurn::user("y")]).await.unwrap();
        store.append(&key("other", "s3"), &[ConversationTurn::user("z")]).await.unwrap();

        assert_eq!(store.session_count(&tenant).unwrap(), 2);
        let sessions = store.list_sessions(&tenant, 10, 0).unwrap();
        assert_eq!(sessions, vec![SessionId::from_raw("s2"), SessionId::from_raw("s1")]);
        assert_eq!(store.list_sessions(&tenant, 1, 1).unwrap(), vec![SessionId::from_raw("s1")]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_appends_from_many_tasks_all_land() {
        let store = setup();
        let k = key("t", "busy");
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..8 {
            let store = store.clone();
            let k = k.clone();
            tasks.spawn(async move {
                store.append(&k, &[ConversationTurn::user(format!("m{i}"))]).await
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap().unwrap();
        }
        assert_eq!(store.read(&k).await.unwrap().len(), 8);
    }

    #[tokio::test]
    async fn corrupt_role_is_reported() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO conversation_turns (tenant_id, session_id, role, content, turn_at, created_at)
                 VALUES ('t', 's', 'narrator', 'x', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
                [],
            )?;
            Ok(())
        })
        .unwrap();
        let err = DurableStore::new(db).read(&key("t", "s")).await.unwrap_err();
        assert!(matches!(err, StoreError::CorruptRow { column: "role", .. }));
    }
}
