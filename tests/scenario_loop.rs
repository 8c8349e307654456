//! End-to-end loop scenarios against a mock upstream.
//!
//! Each test wires the agent at a mockito server, runs a bounded number of
//! rounds and asserts on the calls that reached the wire plus the runtime
//! counters. Mock bodies reuse the site's datagrid shape.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use mockito::{Matcher, Server, ServerGuard};

use autoelective::config::Config;
use autoelective::course::Course;
use autoelective::engine::{Context, run_agent};

const STUDENT_ID: &str = "2200012345";

fn test_config(server: &ServerGuard, max_rounds: u64) -> Config {
    let mut cfg = Config::default();
    cfg.user.student_id = STUDENT_ID.to_string();
    cfg.user.password = "hunter2".to_string();
    cfg.net.iaaa_base_url = server.url();
    cfg.net.elective_base_url = server.url();
    cfg.client.refresh_interval = 0.05;
    cfg.client.refresh_random_deviation = 0.0;
    cfg.client.login_loop_interval = 0.02;
    cfg.client.pool_size = 1;
    cfg.client.pool_reset_cooldown = 0.0;
    cfg.client.refresh_backoff.enable = false;
    cfg.client.iaaa_backoff.enable = false;
    cfg.resilience.not_in_operation_cooldown_seconds = 0.0;
    cfg.resilience.offline_observe_seconds = 0.0;
    cfg.captcha.adaptive_report_interval = 0;
    cfg.runtime.stat_report_interval = 0;
    cfg.runtime.max_rounds = Some(max_rounds);
    cfg.runtime.web_log_dir = std::env::temp_dir()
        .join(format!("autoelective-test-{}", std::process::id()))
        .display()
        .to_string();
    cfg
}

fn listing_page(plan_rows: &str, elected_rows: &str) -> String {
    format!(
        r#"<html><head><title>补退选</title></head><body><table><tr><td>
        <table class="datagrid">
          <tr class="datagrid-header"><th>课程名</th><th>班号</th><th>开课单位</th><th>限数/已选</th><th>补选</th></tr>
          {plan_rows}
        </table>
        <table class="datagrid">
          <tr class="datagrid-header"><th>课程名</th><th>班号</th><th>开课单位</th></tr>
          {elected_rows}
        </table>
        </td></tr></table></body></html>"#
    )
}

fn plan_row(name: &str, class_no: &str, school: &str, max: u32, used: u32, href: &str) -> String {
    format!(
        r#"<tr class="datagrid-odd"><td>{name}</td><td>{class_no}</td><td>{school}</td><td>{max} / {used}</td><td><a href="{href}">补选</a></td></tr>"#
    )
}

fn elected_row(name: &str, class_no: &str, school: &str) -> String {
    format!(
        r#"<tr class="datagrid-even"><td>{name}</td><td>{class_no}</td><td>{school}</td></tr>"#
    )
}

fn tip_page(tip: &str, elected_rows: &str) -> String {
    format!(
        r#"<html><head><title>提示</title></head><body>
        <td id="msgTips"><table><tr><td><table><tr><td>!</td><td>{tip}</td></tr></table></td></tr></table></td>
        <table><tr><td>
        <table class="datagrid">
          <tr class="datagrid-header"><th>课程名</th><th>班号</th><th>开课单位</th><th>限数/已选</th><th>补选</th></tr>
        </table>
        <table class="datagrid">
          <tr class="datagrid-header"><th>课程名</th><th>班号</th><th>开课单位</th></tr>
          {elected_rows}
        </table>
        </td></tr></table></body></html>"#
    )
}

/// Login endpoints shared by every scenario.
async fn mock_login(server: &mut ServerGuard) -> Vec<mockito::Mock> {
    let home = server
        .mock("GET", "/oauth/home")
        .with_status(200)
        .with_body("ok")
        .expect_at_least(0)
        .create_async()
        .await;
    let login = server
        .mock("POST", "/oauth/login")
        .with_status(200)
        .with_body(r#"{"success": true, "token": "tok-1"}"#)
        .expect_at_least(0)
        .create_async()
        .await;
    let sso = server
        .mock("GET", "/ssoLogin")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body("<html><body>welcome</body></html>")
        .expect_at_least(0)
        .create_async()
        .await;
    vec![home, login, sso]
}

async fn run_with_timeout(ctx: Arc<Context>) {
    tokio::time::timeout(Duration::from_secs(30), run_agent(ctx))
        .await
        .expect("agent did not finish in time")
        .expect("agent failed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn no_availability_generates_no_captcha_traffic() {
    let mut server = Server::new_async().await;
    let _login = mock_login(&mut server).await;

    // The course is watched but full the whole time.
    let body = listing_page(
        &plan_row("代数", "1", "数学学院", 10, 10, "/electA?x=1"),
        "",
    );
    let listing = server
        .mock("GET", "/SupplyCancel")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(body)
        .expect_at_least(1)
        .create_async()
        .await;
    let draw = server
        .mock("GET", "/DrawServlet")
        .match_query(Matcher::Any)
        .expect(0)
        .create_async()
        .await;
    let validate = server
        .mock("POST", "/validate.do")
        .match_query(Matcher::Any)
        .expect(0)
        .create_async()
        .await;
    let elect = server
        .mock("GET", "/electA")
        .match_query(Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let mut cfg = test_config(&server, 5);
    cfg.courses = vec![Course::new("代数", "1", "数学学院")];
    let ctx = Context::new(cfg).unwrap();
    run_with_timeout(Arc::clone(&ctx)).await;

    listing.assert_async().await;
    draw.assert_async().await;
    validate.assert_async().await;
    elect.assert_async().await;
    assert!(ctx.stats.counter("supply_cancel") >= 1);
    assert_eq!(ctx.stats.counter("captcha_attempt"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_burst_on_availability() {
    let mut server = Server::new_async().await;
    let _login = mock_login(&mut server).await;

    // One seat on the first refresh, gone afterwards (and elected).
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_for_body = Arc::clone(&calls);
    let listing = server
        .mock("GET", "/SupplyCancel")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body_from_request(move |_| {
            let n = calls_for_body.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                listing_page(
                    &plan_row("代数", "1", "数学学院", 10, 9, "/electA?x=1"),
                    "",
                )
                .into_bytes()
            } else {
                listing_page(
                    &plan_row("代数", "1", "数学学院", 10, 10, "/electA?x=1"),
                    &elected_row("代数", "1", "数学学院"),
                )
                .into_bytes()
            }
        })
        .expect_at_least(2)
        .create_async()
        .await;
    let draw = server
        .mock("GET", "/DrawServlet")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(b"\xff\xd8fakejpeg".to_vec())
        .expect(1)
        .create_async()
        .await;
    let validate = server
        .mock("POST", "/validate.do")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(r#"{"valid": "2"}"#)
        .expect(1)
        .create_async()
        .await;
    let elect = server
        .mock("GET", "/electA")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(tip_page("补选课程成功！", &elected_row("代数", "1", "数学学院")))
        .expect(1)
        .create_async()
        .await;

    let mut cfg = test_config(&server, 10);
    cfg.courses = vec![Course::new("代数", "1", "数学学院")];
    let ctx = Context::new(cfg).unwrap();
    run_with_timeout(Arc::clone(&ctx)).await;

    listing.assert_async().await;
    draw.assert_async().await;
    validate.assert_async().await;
    elect.assert_async().await;
    assert_eq!(ctx.stats.counter("captcha_validate_pass"), 1);
    assert_eq!(ctx.stats.counter("elect_attempt"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mutex_partner_skipped_after_first_success() {
    let mut server = Server::new_async().await;
    let _login = mock_login(&mut server).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let calls_for_body = Arc::clone(&calls);
    let _listing = server
        .mock("GET", "/SupplyCancel")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body_from_request(move |_| {
            let n = calls_for_body.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                // Both mutex partners open at once.
                let rows = format!(
                    "{}{}",
                    plan_row("代数", "1", "数学学院", 10, 9, "/electA?x=1"),
                    plan_row("几何", "2", "数学学院", 10, 9, "/electB?x=2"),
                );
                listing_page(&rows, "").into_bytes()
            } else {
                let rows = format!(
                    "{}{}",
                    plan_row("代数", "1", "数学学院", 10, 10, "/electA?x=1"),
                    plan_row("几何", "2", "数学学院", 10, 9, "/electB?x=2"),
                );
                listing_page(&rows, &elected_row("代数", "1", "数学学院")).into_bytes()
            }
        })
        .expect_at_least(1)
        .create_async()
        .await;
    let draw = server
        .mock("GET", "/DrawServlet")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(b"\xff\xd8fakejpeg".to_vec())
        .expect(1)
        .create_async()
        .await;
    let _validate = server
        .mock("POST", "/validate.do")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(r#"{"valid": "2"}"#)
        .expect(1)
        .create_async()
        .await;
    // The winner's election returns a listing that already carries it.
    let elect_a = server
        .mock("GET", "/electA")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(tip_page("补选课程成功！", &elected_row("代数", "1", "数学学院")))
        .expect(1)
        .create_async()
        .await;
    let elect_b = server
        .mock("GET", "/electB")
        .match_query(Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let mut cfg = test_config(&server, 10);
    cfg.courses = vec![
        Course::new("代数", "1", "数学学院"),
        Course::new("几何", "2", "数学学院"),
    ];
    cfg.mutexes = vec![vec![0, 1]];
    let ctx = Context::new(cfg).unwrap();
    run_with_timeout(Arc::clone(&ctx)).await;

    draw.assert_async().await;
    elect_a.assert_async().await;
    elect_b.assert_async().await;
    assert_eq!(ctx.stats.counter("elect_attempt"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn offline_enters_and_recovers_with_pool_reset() {
    let mut server = Server::new_async().await;
    // IAAA lives on the mock server; the elective host is a dead port, so
    // every SSO attempt is a connection-classified failure.
    let _home = server
        .mock("GET", "/oauth/home")
        .with_status(200)
        .with_body("ok")
        .expect_at_least(1)
        .create_async()
        .await;
    let _login = server
        .mock("POST", "/oauth/login")
        .with_status(200)
        .with_body(r#"{"success": true, "token": "tok-1"}"#)
        .expect_at_least(0)
        .create_async()
        .await;

    let mut cfg = test_config(&server, 3);
    cfg.net.elective_base_url = "http://127.0.0.1:9".to_string();
    cfg.courses = vec![Course::new("代数", "1", "数学学院")];
    cfg.resilience.offline_error_threshold = 2;
    cfg.resilience.offline_cooldown_seconds = 0.0;
    cfg.resilience.offline_probe_interval = 0.05;
    let ctx = Context::new(cfg).unwrap();
    run_with_timeout(Arc::clone(&ctx)).await;

    assert!(ctx.stats.counter("offline_enter") >= 1);
    assert!(ctx.stats.counter("offline_recover") >= 1);
    assert!(ctx.stats.counter("pool_reset_count") >= 1);
    assert!(ctx.pools.current_generation() >= 1);
    assert!(ctx.stats.counter("net_error_total") >= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn operation_window_backoff_uses_schedule() {
    let mut server = Server::new_async().await;
    let _login = mock_login(&mut server).await;

    let _listing = server
        .mock("GET", "/SupplyCancel")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(
            r#"<html><head><title>系统提示</title></head><body>
            <td id="msgTips"><table><tr><td><table><tr><td>!</td>
            <td>现在不是补退选阶段，请注意阶段时间</td></tr></table></td></tr></table></td>
            </body></html>"#,
        )
        .expect_at_least(1)
        .create_async()
        .await;

    // The next supplementary phase opens in about 3h10m.
    let start = chrono::Local::now() + chrono::Duration::seconds(3 * 3600 + 10 * 60);
    let end = start + chrono::Duration::hours(48);
    let help_body = format!(
        r#"<html><body><table class="datagrid">
        <tr class="datagrid-header"><th>选课阶段</th><th>开始时间</th><th>结束时间</th></tr>
        <tr class="datagrid-odd"><td>补退选第二轮</td><td>{}</td><td>{}</td></tr>
        </table></body></html>"#,
        start.format("%Y-%m-%d %H:%M"),
        end.format("%Y-%m-%d %H:%M"),
    );
    let help = server
        .mock("GET", "/HelpController")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(help_body)
        .expect(1)
        .create_async()
        .await;

    let mut cfg = test_config(&server, 2);
    cfg.courses = vec![Course::new("代数", "1", "数学学院")];
    let ctx = Context::new(cfg).unwrap();
    run_with_timeout(Arc::clone(&ctx)).await;

    help.assert_async().await;
    let (streak, min_refresh, reason) = ctx.breakers.not_in_operation_state();
    assert!(streak >= 1);
    assert_eq!(min_refresh, 120.0);
    assert!(reason.contains("next=补退选第二轮@"), "{reason}");
    assert!(reason.contains("delta="), "{reason}");
    assert_eq!(ctx.stats.gauge("not_in_operation_min_refresh"), Some(120.0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn provider_degrades_rotates_and_notifies_once() {
    let mut server = Server::new_async().await;
    let _login = mock_login(&mut server).await;

    let _listing = server
        .mock("GET", "/SupplyCancel")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(listing_page(
            &plan_row("代数", "1", "数学学院", 10, 9, "/electA?x=1"),
            "",
        ))
        .expect_at_least(1)
        .create_async()
        .await;
    let draw = server
        .mock("GET", "/DrawServlet")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(b"\xff\xd8fakejpeg".to_vec())
        .expect(2)
        .create_async()
        .await;
    let validate = server
        .mock("POST", "/validate.do")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(r#"{"valid": "0"}"#)
        .expect(2)
        .create_async()
        .await;
    let elect = server
        .mock("GET", "/electA")
        .match_query(Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let mut cfg = test_config(&server, 3);
    cfg.courses = vec![Course::new("代数", "1", "数学学院")];
    cfg.captcha.provider = "dummy".to_string();
    cfg.captcha.fallback_providers = vec!["qwen3_vl_flash".to_string()];
    cfg.captcha.dashscope_api_key = "test-key".to_string();
    cfg.captcha.degrade_failures = 2;
    cfg.captcha.degrade_cooldown = 10.0;
    cfg.captcha.degrade_monitor_only = true;
    cfg.captcha.degrade_notify = true;
    cfg.captcha.degrade_notify_interval = 300.0;
    cfg.captcha.switch_on_degrade = true;
    let ctx = Context::new(cfg).unwrap();
    run_with_timeout(Arc::clone(&ctx)).await;

    draw.assert_async().await;
    validate.assert_async().await;
    elect.assert_async().await;
    assert!(ctx.breakers.captcha_degraded());
    assert_eq!(ctx.stats.counter("captcha_degrade_trigger"), 1);
    assert_eq!(ctx.stats.counter("captcha_degrade_notify"), 1);
    assert_eq!(ctx.chain.current().0, "qwen3_vl_flash");
    assert_eq!(ctx.stats.counter("elect_attempt"), 0);
}
