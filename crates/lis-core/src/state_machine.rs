//! 结果状态机
//!
//! 管理结果记录的完整生命周期状态转换

use crate::error::{LisError, Result};
use crate::models::ResultStatus;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 结果状态转换事件
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ResultEvent {
    Started,
    Completed,
    Delivered,
    Voided,
}

/// 结果状态机
#[derive(Debug)]
pub struct ResultStateMachine {
    transitions: HashMap<(ResultStatus, ResultEvent), ResultStatus>,
}

impl ResultStateMachine {
    /// 创建新的状态机实例
    pub fn new() -> Self {
        let mut transitions = HashMap::new();

        // 定义状态转换规则
        transitions.insert((ResultStatus::Pending, ResultEvent::Started), ResultStatus::InProgress);
        transitions.insert((ResultStatus::InProgress, ResultEvent::Completed), ResultStatus::Completed);
        transitions.insert((ResultStatus::Completed, ResultEvent::Delivered), ResultStatus::Delivered);
        transitions.insert((ResultStatus::Pending, ResultEvent::Voided), ResultStatus::Void);
        transitions.insert((ResultStatus::InProgress, ResultEvent::Voided), ResultStatus::Void);
        transitions.insert((ResultStatus::Completed, ResultEvent::Voided), ResultStatus::Void);

        Self { transitions }
    }

    /// 检查状态转换是否有效
    pub fn can_transition(&self, from: ResultStatus, event: ResultEvent) -> bool {
        self.transitions.contains_key(&(from, event))
    }

    /// 执行状态转换
    pub fn transition(&self, from: ResultStatus, event: ResultEvent) -> Result<ResultStatus> {
        match self.transitions.get(&(from, event)) {
            Some(to) => Ok(*to),
            None => Err(LisError::InvalidStateTransition {
                from: format!("{:?}", from),
                event: format!("{:?}", event),
            }),
        }
    }

    /// 获取状态的所有可能事件
    pub fn possible_events(&self, current: ResultStatus) -> Vec<ResultEvent> {
        self.transitions
            .keys()
            .filter(|(state, _)| *state == current)
            .map(|(_, event)| *event)
            .collect()
    }
}

impl Default for ResultStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        let sm = ResultStateMachine::new();

        // 测试有效转换
        assert!(sm.can_transition(ResultStatus::Pending, ResultEvent::Started));
        assert!(sm.can_transition(ResultStatus::InProgress, ResultEvent::Completed));
        assert!(sm.can_transition(ResultStatus::Completed, ResultEvent::Delivered));
        assert!(sm.can_transition(ResultStatus::InProgress, ResultEvent::Voided));
    }

    #[test]
    fn test_invalid_transitions() {
        let sm = ResultStateMachine::new();

        // 测试无效转换
        assert!(!sm.can_transition(ResultStatus::Delivered, ResultEvent::Started));
        assert!(!sm.can_transition(ResultStatus::Void, ResultEvent::Completed));
        assert!(!sm.can_transition(ResultStatus::Delivered, ResultEvent::Voided));
    }

    #[test]
    fn test_state_execution() {
        let sm = ResultStateMachine::new();

        let result = sm.transition(ResultStatus::Pending, ResultEvent::Started);
        assert!(result.is_ok());
        assert_eq!(result.unwrap(), ResultStatus::InProgress);

        let result = sm.transition(ResultStatus::Pending, ResultEvent::Delivered);
        assert!(result.is_err());
    }
}
