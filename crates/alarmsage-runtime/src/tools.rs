//! The two tools the agent can call, their schemas, and argument validation.
//!
//! Each tool retrieves context, asks the model one question over it, and
//! returns the answer as the tool result.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::generation;
use alarmsage_chat::{ChatMessage, ChatModel, ModelRequest, ToolSpec};
use alarmsage_core::retry::with_backoff;
use alarmsage_core::{Error, Result, RetryPolicy, Timeouts, ToolCall};
use alarmsage_resolve::{AlarmSearch, ManualRetriever};
use alarmsage_store::AlarmRecord;

pub const ALARM_TOOL: &str = "find_solution_for_machine_alarm";
pub const MANUAL_TOOL: &str = "find_info_from_manual";

/// Alarm records handed to the model per lookup.
pub const ALARM_SEARCH_LIMIT: i64 = 10;

/// Function-calling schemas for both tools. The field descriptions are what
/// the model reads to build well-formed calls.
pub fn tool_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: ALARM_TOOL.into(),
            description:
                "Call to get solution for machine alarm codes from the internal knowledge base and manuals."
                    .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "alarmCode": {
                        "type": "string",
                        "description": "Alarm code. Format is <2 characters alarm type which may or may not be present><4 digit alarm number string>. Example: `SW0100`, `0002` are valid alarm codes."
                    },
                    "alarmMessage": {
                        "type": "string",
                        "description": "Alarm message. Example: `PARAMETER ENABLE SWITCH ON`, `ILLEGAL USE OF G41.2/G42.2/G41.5/G42.5`."
                    },
                    "alarmDescription": {
                        "type": "string",
                        "description": "Alarm description describing the alarm and a hint to resolve the alarm. Example: `The parameter setting is enabled (PWE, one bit of parameter No. 8000 is set to 1). To set the parameter, turn this parameter ON. Otherwise, set to OFF.`"
                    }
                },
                "required": ["alarmCode"],
                "additionalProperties": false
            }),
        },
        ToolSpec {
            name: MANUAL_TOOL.into(),
            description: "Call to get information from the manual.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "question": {
                        "type": "string",
                        "description": "User's question to be searched for answers in the manual."
                    }
                },
                "required": ["question"],
                "additionalProperties": false
            }),
        },
    ]
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AlarmToolInput {
    pub alarm_code: String,
    #[serde(default)]
    pub alarm_message: Option<String>,
    #[serde(default)]
    pub alarm_description: Option<String>,
}

impl AlarmToolInput {
    fn message(&self) -> &str {
        self.alarm_message.as_deref().unwrap_or_default().trim()
    }

    fn description(&self) -> &str {
        self.alarm_description.as_deref().unwrap_or_default().trim()
    }

    /// "code message description", skipping absent parts.
    pub fn manual_query(&self) -> String {
        [self.alarm_code.trim(), self.message(), self.description()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn question(&self) -> String {
        format!("What is the solution for {}?", self.manual_query())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManualToolInput {
    pub question: String,
}

/// A validated tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolInvocation {
    FindSolution(AlarmToolInput),
    FindInfo(ManualToolInput),
}

impl ToolInvocation {
    /// Validate a call's name and arguments before any retrieval happens.
    pub fn parse(call: &ToolCall) -> Result<Self> {
        let invalid = |e: serde_json::Error| {
            Error::Validation(format!("invalid arguments for {}: {}", call.name, e))
        };
        match call.name.as_str() {
            ALARM_TOOL => {
                let input: AlarmToolInput =
                    serde_json::from_value(call.arguments.clone()).map_err(invalid)?;
                if input.alarm_code.trim().is_empty() {
                    return Err(Error::Validation("alarmCode must not be empty".into()));
                }
                Ok(ToolInvocation::FindSolution(input))
            }
            MANUAL_TOOL => {
                let input: ManualToolInput =
                    serde_json::from_value(call.arguments.clone()).map_err(invalid)?;
                if input.question.trim().is_empty() {
                    return Err(Error::Validation("question must not be empty".into()));
                }
                Ok(ToolInvocation::FindInfo(input))
            }
            other => Err(Error::Validation(format!("unknown tool '{}'", other))),
        }
    }
}

/// Result of one tool call: the text fed back to the agent, plus any alarm
/// records consulted along the way.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    pub content: String,
    pub alarms: Vec<AlarmRecord>,
}

/// Paragraph text of an Editor.js document. Anything that is not a valid
/// document is returned unchanged.
pub fn flatten_solution(solution: &str) -> String {
    let doc: serde_json::Value = match serde_json::from_str(solution) {
        Ok(v) => v,
        Err(_) => return solution.to_string(),
    };
    let Some(blocks) = doc["blocks"].as_array() else {
        return solution.to_string();
    };
    blocks
        .iter()
        .filter(|b| b["type"] == "paragraph")
        .filter_map(|b| b["data"]["text"].as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn format_alarm(alarm: &AlarmRecord) -> String {
    let mut out = format!(
        "Alarm Code: {}\nAlarm Message: {}\nAlarm Description: {}\n",
        alarm.code, alarm.message, alarm.desc
    );
    if let Some(solution) = &alarm.solution {
        out.push_str(&format!("Solution: {}\n", flatten_solution(solution)));
    }
    out
}

fn alarm_prompt(question: &str, knowledge_base: &str, manuals: &str) -> String {
    format!(
        "You are a helpful assistant that can answer questions from the manuals. \
You are given a context from an internal knowledge base and a context from manuals. \
Answer the question referring to the context and images provided (if any). \
If the answer is found in the context, include the source where you got the information from \
(either from the internal knowledge base or from the manuals). \
Else if you are unable to answer the question based on the context, say so.\n\n\
Here is the question:\n```\n{}\n```\n\n\
Here is the context from internal knowledge base:\n```\n{}\n```\n\n\
Here is the context from manuals:\n```\n{}\n```\n",
        question, knowledge_base, manuals
    )
}

fn manual_prompt(question: &str, context: &str) -> String {
    format!(
        "You are a helpful assistant that can answer questions from the manuals. \
Answer the question based on the context and images provided (if any). \
If there are no images, just answer the question based on the context. \
If you are unable to answer the question based on the context, say so.\n\n\
Here is the question:\n```\n{}\n```\n\n\
Here is the context:\n```\n{}\n```\n",
        question, context
    )
}

/// Executes tool calls against the retrieval engines.
pub struct Toolbox {
    alarms: Arc<AlarmSearch>,
    manuals: Arc<ManualRetriever>,
    model: Arc<dyn ChatModel>,
    timeouts: Timeouts,
    retry: RetryPolicy,
}

impl Toolbox {
    pub fn new(
        alarms: Arc<AlarmSearch>,
        manuals: Arc<ManualRetriever>,
        model: Arc<dyn ChatModel>,
        timeouts: Timeouts,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            alarms,
            manuals,
            model,
            timeouts,
            retry,
        }
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        tool_specs()
    }

    pub fn manuals(&self) -> &ManualRetriever {
        &self.manuals
    }

    /// Validate and run one call for `machine_model`.
    pub async fn invoke(&self, call: &ToolCall, machine_model: &str) -> Result<ToolOutput> {
        let invocation = ToolInvocation::parse(call)?;
        info!("Tool call {} ({})", call.name, call.id);
        match invocation {
            ToolInvocation::FindSolution(input) => {
                self.find_solution_for_machine_alarm(&input, machine_model)
                    .await
            }
            ToolInvocation::FindInfo(input) => {
                self.find_info_from_manual(&input, machine_model).await
            }
        }
    }

    pub async fn find_solution_for_machine_alarm(
        &self,
        input: &AlarmToolInput,
        machine_model: &str,
    ) -> Result<ToolOutput> {
        let query = input.manual_query();
        let (alarms, manual) = tokio::join!(
            self.alarms.hybrid_search(
                input.alarm_code.trim(),
                input.message(),
                input.description(),
                ALARM_SEARCH_LIMIT,
            ),
            self.manuals.retrieve(machine_model, &query),
        );
        let alarms = alarms?;
        let manual = manual?;
        debug!(
            "Alarm tool context: {} alarm(s), {} manual image(s)",
            alarms.len(),
            manual.images.len()
        );

        let knowledge_base = alarms
            .iter()
            .map(format_alarm)
            .collect::<Vec<_>>()
            .join("\n\n");
        let prompt = alarm_prompt(&input.question(), &knowledge_base, &manual.context);
        let content = self.answer(prompt, manual.images).await?;
        Ok(ToolOutput { content, alarms })
    }

    pub async fn find_info_from_manual(
        &self,
        input: &ManualToolInput,
        machine_model: &str,
    ) -> Result<ToolOutput> {
        let manual = self.manuals.retrieve(machine_model, &input.question).await?;
        let prompt = manual_prompt(&input.question, &manual.context);
        let content = self.answer(prompt, manual.images).await?;
        Ok(ToolOutput {
            content,
            alarms: Vec::new(),
        })
    }

    /// One model call over the assembled prompt. Nothing has been shown to
    /// the user yet, so transient failures are retried.
    async fn answer(&self, prompt: String, images: Vec<String>) -> Result<String> {
        with_backoff(&self.retry, "tool answer", || {
            let request =
                ModelRequest::new(vec![ChatMessage::user_with_images(prompt.clone(), images.clone())]);
            generation::complete(self.model.as_ref(), request, &self.timeouts)
        })
        .await
    }
}
