//! Response classification hook chain
//!
//! Every upstream response is pushed through an ordered chain:
//! status check → (JSON) IAAA success check → (HTML) known-error-page scan
//! → tips scan. The output is always a typed value; no caller ever matches
//! on raw strings.
//!
//! The phrase tables below are data on purpose: the site has changed its
//! wording before and will again. Tests pin the tables against fixtures so
//! a wording update is a one-line diff plus a fixture bump.

use serde::Deserialize;

use crate::error::{AuthErrorKind, ElectOutcome, ElectiveError, IgnoreReason};
use crate::parser;

/// 2xx passes; 5xx and the rest map to their own variants.
pub fn check_status(status: u16) -> Result<(), ElectiveError> {
    if (200..300).contains(&status) {
        return Ok(());
    }
    if (500..600).contains(&status) {
        return Err(ElectiveError::ServerError { status });
    }
    Err(ElectiveError::StatusCodeError { status })
}

#[derive(Debug, Deserialize)]
struct IaaaLoginBody {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    errors: Option<IaaaErrors>,
}

#[derive(Debug, Deserialize)]
struct IaaaErrors {
    #[serde(default)]
    code: String,
    #[serde(default)]
    msg: String,
}

/// IAAA error codes that mean the password itself was rejected.
const IAAA_PASSWORD_CODES: &[&str] = &["E01", "E21", "PASSWORD_ERROR"];
/// IAAA error codes that mean we are blocked outright.
const IAAA_FORBIDDEN_CODES: &[&str] = &["E72", "FORBIDDEN", "IP_FORBIDDEN"];

/// Classify an IAAA login response body into a token or a typed failure.
pub fn classify_iaaa_login(body: &str) -> Result<String, ElectiveError> {
    let parsed: IaaaLoginBody =
        serde_json::from_str(body).map_err(|e| ElectiveError::JsonDecode {
            message: format!("IAAA login body: {e}"),
        })?;
    if parsed.success {
        return parsed
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ElectiveError::OperationFailed {
                message: "IAAA login succeeded without a token".to_string(),
            });
    }
    let (code, msg) = parsed
        .errors
        .map(|e| (e.code, e.msg))
        .unwrap_or_default();
    if IAAA_PASSWORD_CODES.contains(&code.as_str()) || msg.contains("密码") {
        return Err(ElectiveError::IaaaIncorrectPassword { message: msg });
    }
    if IAAA_FORBIDDEN_CODES.contains(&code.as_str()) || msg.contains("禁止") {
        return Err(ElectiveError::IaaaForbidden { message: msg });
    }
    Err(ElectiveError::IaaaNotSuccess { code, message: msg })
}

/// Phrases identifying the elective host's known error pages. Scanned in
/// order against the raw body; first match wins.
const ERROR_PAGE_RULES: &[(&str, ErrorPageKind)] = &[
    ("Token无效", ErrorPageKind::Auth(AuthErrorKind::InvalidToken)),
    ("token无效", ErrorPageKind::Auth(AuthErrorKind::InvalidToken)),
    (
        "您尚未登录或者会话超时",
        ErrorPageKind::Auth(AuthErrorKind::SessionExpired),
    ),
    (
        "您的帐号在其它地点登录",
        ErrorPageKind::Auth(AuthErrorKind::SharedSession),
    ),
    (
        "无验证信息",
        ErrorPageKind::Auth(AuthErrorKind::NoAuthInfo),
    ),
    ("不在操作时段", ErrorPageKind::NotInOperation),
    ("现在不是补退选阶段", ErrorPageKind::NotInOperation),
    ("请不要用刷课机刷课", ErrorPageKind::CaughtCheating),
];

#[derive(Debug, Clone, Copy)]
enum ErrorPageKind {
    Auth(AuthErrorKind),
    NotInOperation,
    CaughtCheating,
}

/// Scan an HTML body for the elective host's known error pages. `Ok(())`
/// means the page is not one of them; the caller parses it normally.
pub fn check_html_state(body: &str) -> Result<(), ElectiveError> {
    for (phrase, kind) in ERROR_PAGE_RULES {
        if !body.contains(phrase) {
            continue;
        }
        let message = parser::page_tips(body)
            .or_else(|| parser::page_title(body))
            .unwrap_or_else(|| (*phrase).to_string());
        return Err(match kind {
            ErrorPageKind::Auth(auth) => ElectiveError::Auth {
                kind: *auth,
                message,
            },
            ErrorPageKind::NotInOperation => {
                // Keep the full body text around the phrase: the operation
                // window bounds are extracted from it later.
                ElectiveError::NotInOperationTime {
                    message: if message.len() > 4 { message } else { body_excerpt(body, phrase) },
                }
            }
            ErrorPageKind::CaughtCheating => ElectiveError::CaughtCheating { message },
        });
    }
    Ok(())
}

fn body_excerpt(body: &str, phrase: &str) -> String {
    match body.find(phrase) {
        Some(pos) => {
            let mut end = (pos + 200).min(body.len());
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            body[pos..end].to_string()
        }
        None => phrase.to_string(),
    }
}

/// What a tip phrase means for the submitted course.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TipOutcome {
    Success,
    Skip(IgnoreReason),
    QuotaLimited,
}

/// Tip-cell phrase table for `electSupplement` responses, scanned in order.
pub const TIP_RULES: &[(&str, TipOutcome)] = &[
    ("补选课程成功", TipOutcome::Success),
    ("您已经选过该课程", TipOutcome::Skip(IgnoreReason::Repeated)),
    ("上课时间冲突", TipOutcome::Skip(IgnoreReason::TimeConflict)),
    (
        "考试时间冲突",
        TipOutcome::Skip(IgnoreReason::ExamTimeConflict),
    ),
    (
        "需要经过任课教师的允许",
        TipOutcome::Skip(IgnoreReason::PermissionRequired),
    ),
    (
        "超过学分上限",
        TipOutcome::Skip(IgnoreReason::CreditsLimited),
    ),
    ("互斥课程", TipOutcome::Skip(IgnoreReason::MutualExclusive)),
    (
        "只能选一门英语",
        TipOutcome::Skip(IgnoreReason::MultiEnglish),
    ),
    (
        "只能选一门体育",
        TipOutcome::Skip(IgnoreReason::MultiPE),
    ),
    ("选课人数已满", TipOutcome::QuotaLimited),
    ("已达到限数", TipOutcome::QuotaLimited),
];

/// Classify an `electSupplement` response body into a typed outcome.
///
/// The known-error-page scan runs first, so auth losses and operation
/// window closures surface as errors rather than business outcomes.
pub fn classify_elect(body: &str) -> Result<ElectOutcome, ElectiveError> {
    check_html_state(body)?;
    let Some(tips) = parser::page_tips(body) else {
        return Err(ElectiveError::UnexpectedHtmlFormat {
            message: "electSupplement response without a tips cell".to_string(),
        });
    };
    for (phrase, outcome) in TIP_RULES {
        if tips.contains(phrase) {
            return Ok(match outcome {
                TipOutcome::Success => ElectOutcome::Success {
                    body: body.to_string(),
                },
                TipOutcome::Skip(reason) => ElectOutcome::Skip(*reason),
                TipOutcome::QuotaLimited => ElectOutcome::QuotaLimited,
            });
        }
    }
    Ok(ElectOutcome::Failed {
        body: body.to_string(),
    })
}

#[derive(Debug, Deserialize)]
struct ValidateBody {
    #[serde(default)]
    valid: String,
}

/// Parse a `validate.do` JSON body into its `valid` field (`"2"` passes,
/// `"0"` fails, anything else is unknown).
pub fn parse_validate(body: &str) -> Result<String, ElectiveError> {
    let parsed: ValidateBody = serde_json::from_str(body).map_err(|e| ElectiveError::JsonDecode {
        message: format!("validate body: {e}"),
    })?;
    Ok(parsed.valid)
}
