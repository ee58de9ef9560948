//! Telegram adapter: turns messages and inline-button presses into engine calls.
use std::sync::Arc;

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use teloxide::prelude::*;
use teloxide::types::{
    ChatId, InlineKeyboardButton, InlineKeyboardMarkup, InputFile, MediaKind, MessageKind,
};
use tracing::{error, info, instrument, warn};

use crate::config::Payment;
use crate::engine::{parse_student_id, ApprovalEngine, EngineError};
use crate::model::{ApprovalStatus, Decision, PaymentMethod};

/// Prefix of receipts that are Telegram photo file ids.
pub const TELEGRAM_RECEIPT_PREFIX: &str = "tg:";

/// Telegram rejects inline buttons whose callback data is longer than this.
pub const CALLBACK_DATA_LIMIT: usize = 64;

static ADMIN_CALLBACK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^admin_(pending|approve|reject)_(\d+)_(.+)$").expect("valid callback regex")
});

static MESSAGE_CALLBACK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^admin_msg_(\d+)$").expect("valid callback regex"));

/// Callback data for the review, approve and reject buttons.
pub fn admin_callback(action: &str, student_id: i64, course_id: &str) -> String {
    format!("admin_{}_{}_{}", action, student_id, course_id)
}

/// Inline button, or `None` (logged) when the payload would not fit.
fn callback_button(label: String, data: String) -> Option<InlineKeyboardButton> {
    if data.len() > CALLBACK_DATA_LIMIT {
        warn!(%data, "callback data too long, button skipped");
        return None;
    }
    Some(InlineKeyboardButton::callback(label, data))
}

pub struct BotState {
    pub engine: ApprovalEngine,
    pub payment: Payment,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackAction {
    Review { student_id: i64, course_id: String },
    Decide { student_id: i64, course_id: String, decision: Decision },
    SelectStudent { student_id: i64 },
    Acknowledge,
}

pub fn parse_callback(data: &str) -> Option<CallbackAction> {
    if data.starts_with("notification_course_approved_") {
        return Some(CallbackAction::Acknowledge);
    }
    if let Some(caps) = MESSAGE_CALLBACK_RE.captures(data) {
        let student_id = parse_student_id(&caps[1]).ok()?;
        return Some(CallbackAction::SelectStudent { student_id });
    }
    let caps = ADMIN_CALLBACK_RE.captures(data)?;
    let student_id = parse_student_id(&caps[2]).ok()?;
    let course_id = caps[3].to_string();
    Some(match &caps[1] {
        "pending" => CallbackAction::Review { student_id, course_id },
        "approve" => CallbackAction::Decide { student_id, course_id, decision: Decision::Approve },
        _ => CallbackAction::Decide { student_id, course_id, decision: Decision::Reject },
    })
}

/// Caption format for a payment proof photo: `<course_id> <sham|haram>`.
pub fn parse_submission_caption(caption: &str) -> Result<(String, PaymentMethod), String> {
    let mut parts = caption.split_whitespace();
    let (Some(course_id), Some(method), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err("Caption must be: <course_id> <sham|haram>".into());
    };
    let method = PaymentMethod::parse_method(method)
        .ok_or_else(|| format!("Unknown payment method '{}'. Use sham or haram.", method))?;
    Ok((course_id.to_string(), method))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub full_name: String,
    pub phone: String,
    pub email: String,
    pub study_year: Option<i64>,
    pub specialization: Option<String>,
}

/// `/register name; +phone; email[; year][; specialization]`
pub fn parse_registration(args: &str) -> Result<Registration, String> {
    let fields: Vec<&str> = args.split(';').map(str::trim).collect();
    if fields.len() < 3 || fields.len() > 5 {
        return Err("Usage: /register <full name>; <+phone>; <email>[; <year 3-5>][; <specialization>]".into());
    }
    let full_name = fields[0];
    if full_name.is_empty() {
        return Err("Full name must not be empty.".into());
    }
    let phone = fields[1];
    if !phone.starts_with('+') || phone.len() < 10 {
        return Err("Please enter a valid phone number, e.g. +963999999999".into());
    }
    let email = fields[2].to_lowercase();
    if !email.contains('@') || !email.contains('.') {
        return Err("Please enter a valid email, e.g. student@example.com".into());
    }
    let study_year = match fields.get(3).filter(|y| !y.is_empty()) {
        Some(raw) => match raw.parse::<i64>() {
            Ok(year @ 3..=5) => Some(year),
            _ => return Err("Study year must be 3, 4 or 5.".into()),
        },
        None => None,
    };
    let specialization = fields
        .get(4)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());
    Ok(Registration {
        full_name: full_name.to_string(),
        phone: phone.to_string(),
        email,
        study_year,
        specialization,
    })
}

/// What the user gets to read when an engine call fails.
pub fn describe_error(err: &EngineError) -> String {
    match err {
        EngineError::NotFound { .. } => "No request exists for this course.".into(),
        EngineError::StudentNotFound(_) => "Student not found.".into(),
        EngineError::Unauthorized(_) => "❌ Not authorized.".into(),
        EngineError::Validation(msg) => format!("❌ Invalid request: {}", msg),
        EngineError::Store(_) => "Something went wrong, please try again later.".into(),
    }
}

fn status_label(status: ApprovalStatus) -> &'static str {
    match status {
        ApprovalStatus::Pending => "⏳ pending",
        ApprovalStatus::Approved => "✅ approved",
        ApprovalStatus::Rejected => "❌ rejected",
    }
}

/// `/msg <student id> <text>`
pub fn parse_direct_message(args: &str) -> Result<(i64, &str), String> {
    let usage = "Usage: /msg <student id> <message>";
    let (id, text) = args.split_once(char::is_whitespace).ok_or_else(|| usage.to_string())?;
    let student_id = parse_student_id(id).map_err(|_| usage.to_string())?;
    let text = text.trim();
    if text.is_empty() {
        return Err(usage.into());
    }
    Ok((student_id, text))
}

fn decision_keyboard(student_id: i64, course_id: &str) -> InlineKeyboardMarkup {
    let row = [("Approve", "approve"), ("Reject", "reject")]
        .into_iter()
        .filter_map(|(label, action)| {
            callback_button(label.to_string(), admin_callback(action, student_id, course_id))
        })
        .collect::<Vec<_>>();
    InlineKeyboardMarkup::new(vec![row])
}

pub async fn on_message(bot: Bot, msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    if let Err(err) = handle_message(&bot, &state, &msg).await {
        error!(?err, "failed to handle message");
    }
    respond(())
}

pub async fn on_callback(bot: Bot, q: CallbackQuery, state: Arc<BotState>) -> ResponseResult<()> {
    if let Err(err) = handle_callback(&bot, &state, &q).await {
        error!(?err, "failed to handle callback");
    }
    respond(())
}

#[instrument(skip_all)]
async fn handle_message(bot: &Bot, state: &BotState, msg: &Message) -> Result<()> {
    let user = match msg.from() {
        Some(u) => u,
        None => return Ok(()),
    };
    let caller_id = user.id.0 as i64;

    let MessageKind::Common(common) = &msg.kind else {
        return Ok(());
    };

    if let MediaKind::Photo(photo) = &common.media_kind {
        let Some(size) = photo.photo.last() else {
            return Ok(());
        };
        let reply = match msg.caption().map(parse_submission_caption) {
            None => "Send the payment proof photo with the caption: <course_id> <sham|haram>".to_string(),
            Some(Err(hint)) => hint,
            Some(Ok((course_id, method))) => {
                state.engine.ensure_registered(caller_id, &user.full_name()).await?;
                let receipt = format!("{}{}", TELEGRAM_RECEIPT_PREFIX, size.file.id);
                match state.engine.submit(caller_id, &course_id, method, Some(&receipt)).await {
                    Ok(_) => {
                        let name = state.engine.catalog().lookup(&course_id).name;
                        format!("✅ Payment proof for {} received. We will notify you once it is reviewed.", name)
                    }
                    Err(err) => describe_error(&err),
                }
            }
        };
        bot.send_message(msg.chat.id, reply).await?;
        return Ok(());
    }

    let Some(text) = msg.text() else {
        bot.send_message(msg.chat.id, "Unsupported message type.").await?;
        return Ok(());
    };
    let trimmed = text.trim();
    let (command, args) = match trimmed.split_once(char::is_whitespace) {
        Some((c, a)) => (c, a.trim()),
        None => (trimmed, ""),
    };
    let is_admin = state.engine.is_admin(caller_id);

    match command {
        "/start" if is_admin => {
            bot.send_message(
                msg.chat.id,
                "🔑 Admin panel\n\n/admin – pending payment approvals\n/stats – statistics\n/student <id> – student details\n/students – message a student\n/broadcast <text> – message every student",
            )
            .await?;
        }
        "/start" => {
            let student = state.engine.ensure_registered(caller_id, &user.full_name()).await?;
            info!(student_id = caller_id, "student started bot");
            bot.send_message(msg.chat.id, welcome_text(&student.display_name(), &state.payment))
                .await?;
        }
        "/register" => {
            let reply = match parse_registration(args) {
                Ok(reg) => match state
                    .engine
                    .register_student(
                        caller_id,
                        &reg.full_name,
                        &reg.phone,
                        &reg.email,
                        reg.study_year,
                        reg.specialization.as_deref(),
                    )
                    .await
                {
                    Ok(()) => format!("✅ Registered as {}.", reg.full_name),
                    Err(err) => describe_error(&err),
                },
                Err(hint) => hint,
            };
            bot.send_message(msg.chat.id, reply).await?;
        }
        "/courses" => {
            bot.send_message(msg.chat.id, courses_text(state)).await?;
        }
        "/mycourses" => {
            let enrollments = state.engine.my_enrollments(caller_id).await?;
            let reply = if enrollments.is_empty() {
                "You have no course requests yet.".to_string()
            } else {
                enrollments
                    .iter()
                    .map(|e| {
                        format!(
                            "• {} – {}",
                            state.engine.catalog().lookup(&e.course_id).name,
                            status_label(e.approval_status)
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            };
            bot.send_message(msg.chat.id, reply).await?;
        }
        "/admin" => send_pending_list(bot, state, msg.chat.id, caller_id).await?,
        "/students" => send_student_list(bot, state, msg.chat.id, caller_id).await?,
        "/broadcast" => {
            let reply = match state.engine.broadcast(caller_id, args).await {
                Ok(report) => format!(
                    "✅ Broadcast sent to {} of {} students.",
                    report.delivered, report.recipients
                ),
                Err(err) => describe_error(&err),
            };
            bot.send_message(msg.chat.id, reply).await?;
        }
        "/msg" => {
            let reply = match parse_direct_message(args) {
                Ok((student_id, text)) => {
                    match state.engine.message_student(caller_id, student_id, text).await {
                        Ok(true) => "✅ Message sent.".to_string(),
                        Ok(false) => "⚠️ The student could not be reached.".to_string(),
                        Err(err) => describe_error(&err),
                    }
                }
                Err(hint) if is_admin => hint,
                Err(_) => describe_error(&EngineError::Unauthorized(caller_id)),
            };
            bot.send_message(msg.chat.id, reply).await?;
        }
        "/contact" => {
            let reply = if args.is_empty() {
                "Write your message after the command: /contact <message>".to_string()
            } else {
                match state.engine.contact_admin(caller_id, args).await {
                    Ok(true) => "✅ Your message was sent to the administration.".to_string(),
                    Ok(false) => "⚠️ The administration could not be reached, please try later.".to_string(),
                    Err(err) => describe_error(&err),
                }
            };
            bot.send_message(msg.chat.id, reply).await?;
        }
        "/stats" => {
            let reply = match state.engine.stats(caller_id).await {
                Ok(c) => format!(
                    "📊 Statistics\n\n👥 Students: {}\n⏳ Pending: {}\n✅ Approved: {}\n❌ Rejected: {}",
                    c.students, c.pending, c.approved, c.rejected
                ),
                Err(err) => describe_error(&err),
            };
            bot.send_message(msg.chat.id, reply).await?;
        }
        "/student" => {
            let reply = match parse_student_id(args) {
                Ok(student_id) => match state.engine.student_overview(caller_id, student_id).await {
                    Ok(overview) => {
                        let s = &overview.student;
                        let courses = overview
                            .enrollments
                            .iter()
                            .map(|e| {
                                format!(
                                    "• {} – {}",
                                    state.engine.catalog().lookup(&e.course_id).name,
                                    status_label(e.approval_status)
                                )
                            })
                            .collect::<Vec<_>>();
                        format!(
                            "👤 Name: {}\n🆔 Id: {}\n📞 Phone: {}\n✉️ Email: {}\n📚 Year: {}\n🎓 Specialization: {}\n📚 Courses: {}\n\n{}",
                            s.display_name(),
                            s.telegram_id,
                            if s.phone.is_empty() { "-" } else { s.phone.as_str() },
                            if s.email.is_empty() { "-" } else { s.email.as_str() },
                            s.study_year.map(|y| y.to_string()).unwrap_or_else(|| "-".into()),
                            s.specialization.as_deref().unwrap_or("-"),
                            courses.len(),
                            if courses.is_empty() { "No courses.".to_string() } else { courses.join("\n") },
                        )
                    }
                    Err(err) => describe_error(&err),
                },
                Err(err) => describe_error(&err),
            };
            bot.send_message(msg.chat.id, reply).await?;
        }
        c if c.starts_with('/') => {
            bot.send_message(msg.chat.id, "Unknown command.").await?;
        }
        _ => {
            bot.send_message(
                msg.chat.id,
                "To enroll, send a photo of your payment receipt with the caption: <course_id> <sham|haram>\nSee /courses for the list.",
            )
            .await?;
        }
    }
    Ok(())
}

fn welcome_text(name: &str, payment: &Payment) -> String {
    let mut text = format!("👋 Welcome {}!\n\nBrowse /courses, then pay through one of:\n", name);
    text.push_str(&format!(
        "• Sham Cash: {}\n• Haram: {}\n",
        if payment.sham_number.is_empty() { "-" } else { payment.sham_number.as_str() },
        if payment.haram_number.is_empty() { "-" } else { payment.haram_number.as_str() },
    ));
    text.push_str("\nThen send a photo of the receipt with the caption: <course_id> <sham|haram>");
    text.push_str("\n\nQuestions? /contact <message>");
    text
}

fn courses_text(state: &BotState) -> String {
    let courses = state.engine.catalog().courses();
    if courses.is_empty() {
        return "No courses are open right now.".into();
    }
    let mut text = String::from("📚 Courses\n\n");
    for course in courses {
        text.push_str(&format!("• {} – id: {}\n", course.name, course.id));
    }
    text
}

async fn send_pending_list(bot: &Bot, state: &BotState, chat_id: ChatId, caller_id: i64) -> Result<()> {
    let pending = match state.engine.pending_requests(caller_id).await {
        Ok(p) => p,
        Err(err) => {
            bot.send_message(chat_id, describe_error(&err)).await?;
            return Ok(());
        }
    };
    if pending.is_empty() {
        bot.send_message(chat_id, "No pending requests.").await?;
        return Ok(());
    }
    let buttons = pending
        .iter()
        .filter_map(|p| {
            callback_button(
                format!("{} • {}", p.student_name, state.engine.catalog().lookup(&p.course_id).name),
                admin_callback("pending", p.student_id, &p.course_id),
            )
        })
        .map(|button| vec![button])
        .collect::<Vec<_>>();
    bot.send_message(chat_id, "✅ Pending payment approvals\n\nPick a request to review:")
        .reply_markup(InlineKeyboardMarkup::new(buttons))
        .await?;
    Ok(())
}

async fn send_student_list(bot: &Bot, state: &BotState, chat_id: ChatId, caller_id: i64) -> Result<()> {
    let students = match state.engine.list_students(caller_id).await {
        Ok(s) => s,
        Err(err) => {
            bot.send_message(chat_id, describe_error(&err)).await?;
            return Ok(());
        }
    };
    if students.is_empty() {
        bot.send_message(chat_id, "❌ No students yet.").await?;
        return Ok(());
    }
    let buttons = students
        .iter()
        .filter_map(|s| {
            callback_button(
                format!("👤 {}", s.display_name()),
                format!("admin_msg_{}", s.telegram_id),
            )
        })
        .map(|button| vec![button])
        .collect::<Vec<_>>();
    bot.send_message(chat_id, format!("👥 Students: {}\n\nPick one to message:", students.len()))
        .reply_markup(InlineKeyboardMarkup::new(buttons))
        .await?;
    Ok(())
}

#[instrument(skip_all)]
async fn handle_callback(bot: &Bot, state: &BotState, q: &CallbackQuery) -> Result<()> {
    let caller_id = q.from.id.0 as i64;
    let Some(action) = q.data.as_deref().and_then(parse_callback) else {
        bot.answer_callback_query(q.id.clone()).await?;
        return Ok(());
    };

    match action {
        CallbackAction::Acknowledge => {
            bot.answer_callback_query(q.id.clone()).text("Done").await?;
            if let Some(m) = &q.message {
                bot.edit_message_reply_markup(m.chat.id, m.id).await?;
            }
        }
        CallbackAction::SelectStudent { student_id } => {
            bot.answer_callback_query(q.id.clone()).await?;
            let reply = if state.engine.is_admin(caller_id) {
                format!("Send your message as:\n/msg {} <message>", student_id)
            } else {
                describe_error(&EngineError::Unauthorized(caller_id))
            };
            reply_in_place(bot, q, &reply).await?;
        }
        CallbackAction::Review { student_id, course_id } => {
            bot.answer_callback_query(q.id.clone()).await?;
            let (student, enrollment) =
                match state.engine.enrollment_detail(caller_id, student_id, &course_id).await {
                    Ok(detail) => detail,
                    Err(err) => {
                        reply_in_place(bot, q, &describe_error(&err)).await?;
                        return Ok(());
                    }
                };
            let text = format!(
                "Request under review:\nStudent: {}\nId: {}\nCourse: {}\nMethod: {}\nStatus: {}",
                student.display_name(),
                student.telegram_id,
                state.engine.catalog().lookup(&course_id).name,
                enrollment.payment_method.as_str(),
                status_label(enrollment.approval_status),
            );
            let keyboard = decision_keyboard(student_id, &course_id);
            let photo = enrollment
                .payment_receipt
                .as_deref()
                .and_then(|r| r.strip_prefix(TELEGRAM_RECEIPT_PREFIX));
            if let (Some(file_id), Some(m)) = (photo, &q.message) {
                match bot
                    .send_photo(m.chat.id, InputFile::file_id(file_id.to_string()))
                    .caption(text.clone())
                    .reply_markup(keyboard.clone())
                    .await
                {
                    Ok(_) => return Ok(()),
                    Err(err) => warn!(?err, student_id, "failed to show receipt photo"),
                }
            }
            if let Some(m) = &q.message {
                bot.edit_message_text(m.chat.id, m.id, text)
                    .reply_markup(keyboard)
                    .await?;
            }
        }
        CallbackAction::Decide { student_id, course_id, decision } => {
            bot.answer_callback_query(q.id.clone()).await?;
            let reply = match state.engine.decide(caller_id, student_id, &course_id, decision).await {
                Ok(ApprovalStatus::Approved) => "Approved. The student will be notified shortly.".to_string(),
                Ok(_) => "Rejected.".to_string(),
                Err(err) => describe_error(&err),
            };
            reply_in_place(bot, q, &reply).await?;
        }
    }
    Ok(())
}

/// Replace the text (or caption, for receipt photos) of the message holding the buttons.
async fn reply_in_place(bot: &Bot, q: &CallbackQuery, text: &str) -> Result<()> {
    let Some(m) = &q.message else {
        return Ok(());
    };
    if m.photo().is_some() {
        bot.edit_message_caption(m.chat.id, m.id)
            .caption(text.to_string())
            .await?;
    } else {
        bot.edit_message_text(m.chat.id, m.id, text.to_string()).await?;
    }
    Ok(())
}
