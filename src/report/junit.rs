//! JUnit XML export.
//!
//! A quick-xml `Writer` pipeline that renders one JUnit report directly
//! from the terminal `TestResult`s this process already holds — there is
//! nothing to merge here, since the Persistence Store is the single
//! source of truth for every attempt.

use std::io::Cursor;
use std::path::Path;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::model::{AllocationStatus, TestResult};

/// Renders `results` as one `<testsuites>` document and writes it to `path`.
pub fn write_junit_report(results: &[TestResult], path: &Path) -> std::io::Result<()> {
    let xml = render(results);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, xml)
}

fn render(results: &[TestResult]) -> String {
    let mut writer = Writer::new(Cursor::new(Vec::new()));

    let _ = writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)));
    let _ = writer.write_event(Event::Text(BytesText::new("\n")));

    let failures = results
        .iter()
        .filter(|r| r.status == AllocationStatus::Failed)
        .count();
    let errors = results
        .iter()
        .filter(|r| r.status == AllocationStatus::TimedOut)
        .count();
    let total_time: f64 = results
        .iter()
        .map(|r| (r.ended_at - r.started_at).num_milliseconds().max(0) as f64 / 1000.0)
        .sum();

    let mut suite = BytesStart::new("testsuite");
    suite.push_attribute(("name", "marshal"));
    suite.push_attribute(("tests", results.len().to_string().as_str()));
    suite.push_attribute(("failures", failures.to_string().as_str()));
    suite.push_attribute(("errors", errors.to_string().as_str()));
    suite.push_attribute(("time", format!("{total_time:.3}").as_str()));
    let _ = writer.write_event(Event::Start(suite));
    let _ = writer.write_event(Event::Text(BytesText::new("\n")));

    for result in results {
        write_testcase(&mut writer, result);
    }

    let _ = writer.write_event(Event::End(BytesEnd::new("testsuite")));
    let _ = writer.write_event(Event::Text(BytesText::new("\n")));

    String::from_utf8(writer.into_inner().into_inner()).unwrap_or_default()
}

fn write_testcase(writer: &mut Writer<Cursor<Vec<u8>>>, result: &TestResult) {
    let time = (result.ended_at - result.started_at).num_milliseconds().max(0) as f64 / 1000.0;
    let mut elem = BytesStart::new("testcase");
    elem.push_attribute(("name", result.test_id.as_str()));
    elem.push_attribute(("classname", "marshal"));
    elem.push_attribute(("time", format!("{time:.3}").as_str()));

    match result.status {
        AllocationStatus::Completed => {
            let _ = writer.write_event(Event::Empty(elem));
        }
        AllocationStatus::Failed | AllocationStatus::TimedOut => {
            let _ = writer.write_event(Event::Start(elem));
            let tag = if result.status == AllocationStatus::TimedOut { "error" } else { "failure" };
            let mut failure = BytesStart::new(tag);
            let message = result
                .failure_class
                .map(|c| format!("{c:?}"))
                .unwrap_or_else(|| format!("exit code {:?}", result.exit_code));
            failure.push_attribute(("message", message.as_str()));
            let _ = writer.write_event(Event::Start(failure));
            let body = format!("{}\n{}", result.stdout, result.stderr);
            let _ = writer.write_event(Event::Text(BytesText::new(&body)));
            let _ = writer.write_event(Event::End(BytesEnd::new(tag)));
            let _ = writer.write_event(Event::End(BytesEnd::new("testcase")));
        }
        AllocationStatus::Cancelled => {
            let _ = writer.write_event(Event::Start(elem));
            let _ = writer.write_event(Event::Empty(BytesStart::new("skipped")));
            let _ = writer.write_event(Event::End(BytesEnd::new("testcase")));
        }
        AllocationStatus::Pending | AllocationStatus::Allocated | AllocationStatus::Running => {
            // Non-terminal results never reach the reporter; written
            // defensively as a bare testcase if one slips through.
            let _ = writer.write_event(Event::Empty(elem));
        }
    }
    let _ = writer.write_event(Event::Text(BytesText::new("\n")));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ArtifactBundle;
    use tempfile::TempDir;

    fn result(test_id: &str, status: AllocationStatus) -> TestResult {
        let now = chrono::Utc::now();
        TestResult {
            test_id: test_id.to_string(),
            attempt: 1,
            status,
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            started_at: now,
            ended_at: now,
            artifacts: ArtifactBundle::default(),
            failure_class: None,
            env_id: "e1".to_string(),
        }
    }

    #[test]
    fn renders_one_testcase_per_result() {
        let xml = render(&[
            result("t1", AllocationStatus::Completed),
            result("t2", AllocationStatus::Failed),
        ]);
        assert!(xml.contains("tests=\"2\""));
        assert!(xml.contains("failures=\"1\""));
        assert!(xml.contains("name=\"t1\""));
        assert!(xml.contains("name=\"t2\""));
    }

    #[test]
    fn writes_report_to_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out").join("junit.xml");
        write_junit_report(&[result("t1", AllocationStatus::Completed)], &path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("testsuite"));
    }
}
