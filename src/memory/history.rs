//! 历史存储：只追加的回合记录，支持单条消息编辑与重试时替换尾部
//!
//! 所有写操作（append / edit / replace_tail / clear）在同一把 tokio Mutex 下串行，
//! 并且先落盘再生效：持久化失败时内存状态保持不变。
//! record_index 与记录在 Vec 中的位置一致，因此读者看到的索引总是从 0 开始连续递增。

use chrono::Utc;
use tokio::sync::Mutex;

use super::{ChatRecord, HistoryError, JsonFile, Message, Role, TurnOrigin};

#[derive(Debug)]
pub struct HistoryStore {
    records: Mutex<Vec<ChatRecord>>,
    file: Option<JsonFile>,
}

impl HistoryStore {
    /// 仅内存（测试或无需持久化的场景）
    pub fn in_memory() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            file: None,
        }
    }

    /// 从 JSON 文件加载；索引不连续或工具调用引用悬空都视为数据损坏
    pub async fn open(file: JsonFile) -> Result<Self, HistoryError> {
        let records: Vec<ChatRecord> = file.load().await?.unwrap_or_default();
        for (position, record) in records.iter().enumerate() {
            if record.record_index != position as u64 {
                return Err(HistoryError::Discontiguous {
                    expected: position as u64,
                    found: record.record_index,
                });
            }
            record.validate()?;
        }
        tracing::info!(path = %file.path().display(), records = records.len(), "history loaded");
        Ok(Self {
            records: Mutex::new(records),
            file: Some(file),
        })
    }

    async fn persist(&self, records: &[ChatRecord]) -> Result<(), HistoryError> {
        match &self.file {
            Some(file) => file.save(records).await,
            None => Ok(()),
        }
    }

    /// 追加一个回合，返回分配的 record_index（空历史为 0，否则为上一条 + 1）
    pub async fn append(&self, origin: TurnOrigin, messages: Vec<Message>) -> Result<u64, HistoryError> {
        let mut records = self.records.lock().await;
        let record_index = records.len() as u64;
        let record = ChatRecord {
            record_index,
            created_at: Utc::now().to_rfc3339(),
            origin,
            messages,
        };
        record.validate()?;
        records.push(record);
        if let Err(e) = self.persist(&records).await {
            records.pop();
            return Err(e);
        }
        Ok(record_index)
    }

    pub async fn list(&self) -> Vec<ChatRecord> {
        self.records.lock().await.clone()
    }

    pub async fn get(&self, record_index: u64) -> Option<ChatRecord> {
        self.records.lock().await.get(record_index as usize).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    /// 重试用的上下文：record_index 之前的所有记录，以及该记录本身
    pub async fn split_at(&self, record_index: u64) -> Result<(Vec<ChatRecord>, ChatRecord), HistoryError> {
        let records = self.records.lock().await;
        let target = records
            .get(record_index as usize)
            .cloned()
            .ok_or(HistoryError::NotFound {
                record_index,
                message_index: None,
            })?;
        Ok((records[..record_index as usize].to_vec(), target))
    }

    /// 覆盖恰好一条消息的 content；role 给出时必须与该消息一致
    pub async fn edit(
        &self,
        record_index: u64,
        message_index: usize,
        role: Option<Role>,
        new_content: String,
    ) -> Result<(), HistoryError> {
        let not_found = HistoryError::NotFound {
            record_index,
            message_index: Some(message_index),
        };
        let mut records = self.records.lock().await;
        let message = match records
            .get_mut(record_index as usize)
            .and_then(|r| r.messages.get_mut(message_index))
        {
            Some(m) if role.map_or(true, |r| r == m.role) => m,
            _ => return Err(not_found),
        };
        let previous = std::mem::replace(&mut message.content, new_content);
        if let Err(e) = self.persist(&records).await {
            records[record_index as usize].messages[message_index].content = previous;
            return Err(e);
        }
        Ok(())
    }

    /// 仅供重试：去掉记录开头 user 消息之后的全部消息（没有 user 消息时整条替换），换成 new_messages；
    /// record_index 不变
    pub async fn replace_tail(&self, record_index: u64, new_messages: Vec<Message>) -> Result<(), HistoryError> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(record_index as usize)
            .ok_or(HistoryError::NotFound {
                record_index,
                message_index: None,
            })?;
        let head = record.head_len();
        let mut candidate = record.messages[..head].to_vec();
        candidate.extend(new_messages);
        ChatRecord {
            messages: candidate.clone(),
            ..record.clone()
        }
        .validate()?;

        let previous = std::mem::replace(&mut record.messages, candidate);
        if let Err(e) = self.persist(&records).await {
            records[record_index as usize].messages = previous;
            return Err(e);
        }
        Ok(())
    }

    /// 清空全部记录，索引计数回到 0
    pub async fn clear(&self) -> Result<(), HistoryError> {
        let mut records = self.records.lock().await;
        let previous = std::mem::take(&mut *records);
        if let Err(e) = self.persist(&records).await {
            *records = previous;
            return Err(e);
        }
        Ok(())
    }
}
