//! Database tools: read-only SQL passthrough and questionnaire introspection.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde_json::{json, Map, Value};

use super::Tool;

/// Upper bound for the introspection helpers, which return whole code lists.
const INTROSPECTION_ROW_LIMIT: usize = 1000;

/// Rows returned by a [`SqlBackend`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRows {
    pub rows: Vec<Map<String, Value>>,
    /// More rows were available than the cap allowed.
    pub truncated: bool,
}

/// A relational data source holding the PIRLS 2021 tables.
#[async_trait]
pub trait SqlBackend: Send + Sync {
    /// Run `sql` with positional `params`, returning at most `max_rows` rows.
    async fn query(&self, sql: &str, params: &[String], max_rows: usize)
        -> anyhow::Result<QueryRows>;
}

/// SQLite file opened read-only for every query.
pub struct SqliteBackend {
    path: PathBuf,
}

impl SqliteBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SqlBackend for SqliteBackend {
    async fn query(
        &self,
        sql: &str,
        params: &[String],
        max_rows: usize,
    ) -> anyhow::Result<QueryRows> {
        let path = self.path.clone();
        let sql = sql.to_string();
        let params = params.to_vec();

        tokio::task::spawn_blocking(move || run_query(&path, &sql, &params, max_rows))
            .await
            .map_err(|e| anyhow::anyhow!("Query task failed: {}", e))?
    }
}

fn run_query(
    path: &Path,
    sql: &str,
    params: &[String],
    max_rows: usize,
) -> anyhow::Result<QueryRows> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| anyhow::anyhow!("Cannot open database {}: {}", path.display(), e))?;
    conn.pragma_update(None, "query_only", true)?;

    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;

    let mut result = QueryRows::default();
    while let Some(row) = rows.next()? {
        if result.rows.len() >= max_rows {
            result.truncated = true;
            break;
        }
        let mut record = Map::new();
        for (idx, name) in columns.iter().enumerate() {
            record.insert(name.clone(), sql_value_to_json(row.get_ref(idx)?));
        }
        result.rows.push(record);
    }
    Ok(result)
}

fn sql_value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => json!(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(format!("<blob: {} bytes>", bytes.len())),
    }
}

/// Only `SELECT` and `WITH` statements are accepted.
fn is_read_only(sql: &str) -> bool {
    let keyword = sql
        .trim_start()
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();
    matches!(keyword.as_str(), "SELECT" | "WITH")
}

/// Map a questionnaire name to its `(entries, answers)` tables.
fn questionnaire_tables(name: &str) -> anyhow::Result<(&'static str, &'static str)> {
    match name.trim().to_ascii_lowercase().as_str() {
        "student" | "students" => Ok(("StudentQuestionnaireEntries", "StudentQuestionnaireAnswers")),
        "school" | "schools" => Ok(("SchoolQuestionnaireEntries", "SchoolQuestionnaireAnswers")),
        "teacher" | "teachers" => Ok(("TeacherQuestionnaireEntries", "TeacherQuestionnaireAnswers")),
        "home" | "homes" => Ok(("HomeQuestionnaireEntries", "HomeQuestionnaireAnswers")),
        "curriculum" | "curricula" => Ok((
            "CurriculumQuestionnaireEntries",
            "CurriculumQuestionnaireAnswers",
        )),
        other => Err(anyhow::anyhow!(
            "Unknown questionnaire '{}'. Expected one of: student, school, teacher, home, curriculum",
            other
        )),
    }
}

const QUESTIONNAIRE_PARAM: &str =
    "Questionnaire to look in: student, school, teacher, home or curriculum";

/// Run a read-only SQL query against the PIRLS database.
pub struct QueryDatabase {
    backend: Arc<dyn SqlBackend>,
    max_rows: usize,
}

impl QueryDatabase {
    pub fn new(backend: Arc<dyn SqlBackend>, max_rows: usize) -> Self {
        Self { backend, max_rows }
    }
}

#[async_trait]
impl Tool for QueryDatabase {
    fn name(&self) -> &str {
        "query_database"
    }

    fn description(&self) -> &str {
        "Run a read-only SQL query (SELECT or WITH) against the PIRLS 2021 database and return the rows as JSON. Results are capped; aggregate in SQL instead of fetching raw rows."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The SQL query to execute"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value) -> anyhow::Result<String> {
        let query = args["query"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'query' argument"))?;

        if !is_read_only(query) {
            return Err(anyhow::anyhow!(
                "Only read-only queries (SELECT or WITH) are allowed"
            ));
        }

        tracing::debug!("Running database query: {}", query);
        let result = self.backend.query(query, &[], self.max_rows).await?;

        if result.truncated {
            tracing::info!("Query result truncated to {} rows", self.max_rows);
        }

        Ok(json!({
            "rows": result.rows,
            "truncated": result.truncated,
        })
        .to_string())
    }
}

/// List the distinct answers given to one questionnaire question.
pub struct GetPossibleAnswers {
    backend: Arc<dyn SqlBackend>,
}

impl GetPossibleAnswers {
    pub fn new(backend: Arc<dyn SqlBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Tool for GetPossibleAnswers {
    fn name(&self) -> &str {
        "get_possible_answers_to_question"
    }

    fn description(&self) -> &str {
        "Return the distinct valid answers to a questionnaire question, identified by its code (e.g. ASBG01 in the student questionnaire). Use before filtering on Answer values."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "questionnaire": {
                    "type": "string",
                    "description": QUESTIONNAIRE_PARAM
                },
                "question_code": {
                    "type": "string",
                    "description": "The question code, e.g. 'ASBG01'"
                }
            },
            "required": ["questionnaire", "question_code"]
        })
    }

    async fn execute(&self, args: Value) -> anyhow::Result<String> {
        let questionnaire = args["questionnaire"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'questionnaire' argument"))?;
        let code = args["question_code"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'question_code' argument"))?;

        let (_, answers_table) = questionnaire_tables(questionnaire)?;
        let sql = format!(
            "SELECT DISTINCT Answer FROM {} WHERE Code = ?1 ORDER BY Answer",
            answers_table
        );
        let result = self
            .backend
            .query(&sql, &[code.to_string()], INTROSPECTION_ROW_LIMIT)
            .await?;

        if result.rows.is_empty() {
            return Ok(format!(
                "No answers found for question code '{}' in the {} questionnaire.",
                code, questionnaire
            ));
        }

        let answers: Vec<Value> = result
            .rows
            .into_iter()
            .filter_map(|mut row| row.remove("Answer"))
            .collect();
        Ok(Value::Array(answers).to_string())
    }
}

/// List the question codes of one category in a questionnaire.
pub struct GetQuestionsOfType {
    backend: Arc<dyn SqlBackend>,
}

impl GetQuestionsOfType {
    pub fn new(backend: Arc<dyn SqlBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Tool for GetQuestionsOfType {
    fn name(&self) -> &str {
        "get_questions_of_given_type"
    }

    fn description(&self) -> &str {
        "Return the codes and texts of all questions of a given type/category in a questionnaire (e.g. 'School Discipline and Safety' in the school questionnaire)."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "questionnaire": {
                    "type": "string",
                    "description": QUESTIONNAIRE_PARAM
                },
                "question_type": {
                    "type": "string",
                    "description": "The Type value of the questions to list"
                }
            },
            "required": ["questionnaire", "question_type"]
        })
    }

    async fn execute(&self, args: Value) -> anyhow::Result<String> {
        let questionnaire = args["questionnaire"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'questionnaire' argument"))?;
        let question_type = args["question_type"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'question_type' argument"))?;

        let (entries_table, _) = questionnaire_tables(questionnaire)?;
        let sql = format!(
            "SELECT Code AS code, Question AS question FROM {} WHERE Type = ?1 ORDER BY Code",
            entries_table
        );
        let result = self
            .backend
            .query(&sql, &[question_type.to_string()], INTROSPECTION_ROW_LIMIT)
            .await?;

        if result.rows.is_empty() {
            return Ok(format!(
                "No questions of type '{}' in the {} questionnaire.",
                question_type, questionnaire
            ));
        }
        Ok(serde_json::to_string(&result.rows)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, Arc<dyn SqlBackend>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pirls.db");
        let conn = Connection::open(&path).expect("create db");
        conn.execute_batch(
            "CREATE TABLE Countries (Country_ID INTEGER PRIMARY KEY, Name TEXT, Code TEXT);
             INSERT INTO Countries VALUES (1, 'Egypt', 'EGY'), (2, 'Ireland', 'IRL'), (3, 'Brazil', 'BRA');
             CREATE TABLE StudentQuestionnaireEntries (Code TEXT PRIMARY KEY, Question TEXT, Type TEXT);
             INSERT INTO StudentQuestionnaireEntries VALUES
                ('ASBG01', 'Are you a girl or a boy?', 'About You'),
                ('ASBG03', 'How often do you speak the language of the test at home?', 'About You'),
                ('ASBR01A', 'I like reading', 'Reading');
             CREATE TABLE StudentQuestionnaireAnswers (Student_ID INTEGER, Code TEXT, Answer TEXT);
             INSERT INTO StudentQuestionnaireAnswers VALUES
                (1, 'ASBG01', 'Girl'), (2, 'ASBG01', 'Boy'), (3, 'ASBG01', 'Girl'),
                (4, 'ASBG01', 'Omitted or invalid'), (1, 'ASBR01A', 'Agree a lot');
             CREATE TABLE Scores (Student_ID INTEGER, Score REAL);
             INSERT INTO Scores VALUES (1, 520.1), (2, 480.5);",
        )
        .expect("seed db");
        (dir, Arc::new(SqliteBackend::new(path)))
    }

    #[test]
    fn read_only_detection() {
        assert!(is_read_only("  select * from Countries"));
        assert!(is_read_only("WITH x AS (SELECT 1) SELECT * FROM x"));
        assert!(is_read_only("SELECT(1)"));
        assert!(!is_read_only("DELETE FROM Countries"));
        assert!(!is_read_only("DROP TABLE Countries"));
    }

    #[tokio::test]
    async fn query_returns_rows_and_respects_cap() {
        let (_dir, backend) = fixture();
        let tool = QueryDatabase::new(backend, 2);

        let out = tool
            .execute(json!({"query": "SELECT Name, Code FROM Countries ORDER BY Country_ID"}))
            .await
            .unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["truncated"], true);
        assert_eq!(parsed["rows"].as_array().unwrap().len(), 2);
        assert_eq!(parsed["rows"][0]["Name"], "Egypt");
    }

    #[tokio::test]
    async fn query_maps_sql_types_to_json() {
        let (_dir, backend) = fixture();
        let tool = QueryDatabase::new(backend, 100);

        let out = tool
            .execute(json!({"query": "SELECT AVG(Score) AS avg, COUNT(*) AS n, NULL AS missing FROM Scores"}))
            .await
            .unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["truncated"], false);
        assert_eq!(parsed["rows"][0]["n"], 2);
        assert!((parsed["rows"][0]["avg"].as_f64().unwrap() - 500.3).abs() < 1e-9);
        assert_eq!(parsed["rows"][0]["missing"], Value::Null);
    }

    #[tokio::test]
    async fn write_statements_are_rejected() {
        let (_dir, backend) = fixture();
        let tool = QueryDatabase::new(backend.clone(), 100);

        let err = tool
            .execute(json!({"query": "DELETE FROM Countries"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("read-only"));

        // A write smuggled behind a CTE is stopped by the read-only connection.
        let err = tool
            .execute(json!({"query": "WITH x AS (SELECT 1) INSERT INTO Countries VALUES (9, 'X', 'XXX')"}))
            .await;
        assert!(err.is_err());
        let rows = backend
            .query("SELECT COUNT(*) AS n FROM Countries", &[], 10)
            .await
            .unwrap();
        assert_eq!(rows.rows[0]["n"], 3);
    }

    #[tokio::test]
    async fn query_errors_are_descriptive() {
        let (_dir, backend) = fixture();
        let tool = QueryDatabase::new(backend, 100);

        assert!(tool.execute(json!({})).await.unwrap_err().to_string().contains("query"));
        let err = tool
            .execute(json!({"query": "SELECT * FROM NoSuchTable"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("NoSuchTable"));
    }

    #[tokio::test]
    async fn missing_database_file_is_an_error() {
        let tool = QueryDatabase::new(
            Arc::new(SqliteBackend::new("/nonexistent/dir/pirls.db")),
            10,
        );
        let err = tool.execute(json!({"query": "SELECT 1"})).await.unwrap_err();
        assert!(err.to_string().contains("Cannot open database"));
    }

    #[tokio::test]
    async fn possible_answers_are_distinct_and_sorted() {
        let (_dir, backend) = fixture();
        let tool = GetPossibleAnswers::new(backend);

        let out = tool
            .execute(json!({"questionnaire": "student", "question_code": "ASBG01"}))
            .await
            .unwrap();
        assert_eq!(out, r#"["Boy","Girl","Omitted or invalid"]"#);

        let out = tool
            .execute(json!({"questionnaire": "Students", "question_code": "NOPE"}))
            .await
            .unwrap();
        assert!(out.starts_with("No answers found"));
    }

    #[tokio::test]
    async fn unknown_questionnaire_is_rejected() {
        let (_dir, backend) = fixture();
        let tool = GetPossibleAnswers::new(backend);
        let err = tool
            .execute(json!({"questionnaire": "parents; DROP TABLE x", "question_code": "A"}))
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Unknown questionnaire"));
    }

    #[tokio::test]
    async fn questions_of_type_lists_codes() {
        let (_dir, backend) = fixture();
        let tool = GetQuestionsOfType::new(backend);

        let out = tool
            .execute(json!({"questionnaire": "student", "question_type": "About You"}))
            .await
            .unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        let codes: Vec<&str> = parsed
            .as_array()
            .unwrap()
            .iter()
            .map(|row| row["code"].as_str().unwrap())
            .collect();
        assert_eq!(codes, vec!["ASBG01", "ASBG03"]);
    }
}
