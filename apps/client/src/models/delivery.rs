#![allow(dead_code)]

//! Typed payloads for the delivery topics pushed over the realtime connection.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Replied,
    InterviewInvited,
    Rejected,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Boss,
    Lagou,
    Liepin,
    Zhilian,
}

/// Payload of the `status` topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryStatusMessage {
    pub is_running: bool,
    pub current_job: Option<String>,
    pub total_delivered: u32,
    pub successful_delivered: u32,
    pub failed_delivered: u32,
    pub last_delivery_time: Option<i64>,
    pub next_delivery_time: Option<i64>,
    pub timestamp: i64,
}

/// Payload of the `progress` topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryProgressMessage {
    pub total_jobs: u32,
    pub processed_jobs: u32,
    pub successful_jobs: u32,
    pub failed_jobs: u32,
    pub progress_percentage: f64,
    pub estimated_time_remaining: i64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRecord {
    pub id: String,
    pub job_id: String,
    pub job_title: String,
    pub company_name: String,
    pub status: DeliveryStatus,
    pub delivery_time: i64,
    pub reply_time: Option<i64>,
    pub reply_content: Option<String>,
    pub greeting_content: Option<String>,
    pub match_score: Option<f64>,
    pub platform: Platform,
    pub job_url: Option<String>,
    pub remarks: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Payload of the `record` topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecordMessage {
    pub record: DeliveryRecord,
    pub timestamp: i64,
}

/// Payload of the `error` topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub message: String,
    #[serde(default)]
    pub timestamp: i64,
}

/// Payload of the `success` topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessMessage {
    pub message: String,
    #[serde(default)]
    pub timestamp: i64,
}

/// Payload carried by envelopes whose `data.action` is `verification_code_required`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationCodeMessage {
    pub request_id: String,
    pub job_name: String,
    pub screenshot_url: Option<String>,
    pub task_id: String,
    #[serde(default)]
    pub timestamp: i64,
}
