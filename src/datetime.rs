use chrono::{DateTime, NaiveDate, Utc};

/// 現在のUTC時間を取得する。
#[cfg(not(test))]
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// 現在の日付(UTC)を取得する。
pub fn today() -> NaiveDate {
    now().date_naive()
}


#[cfg(test)]
pub use mock_datetime::now;

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone, Utc};

    use super::mock_datetime;

    /// モック時間がheartbeatのtimestampに使う`now()`へ反映されることを確認する。
    #[test]
    fn test_mocked_now() {
        let mocked = Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 0).unwrap();
        mock_datetime::set_mock_time(mocked);

        assert_eq!(mock_datetime::now(), mocked);

        mock_datetime::clear_mock_time();
    }

    /// モック時間がbackfillの基準日に使う`today()`へも反映されることを確認する。
    #[test]
    fn test_mocked_today() {
        mock_datetime::set_mock_time(Utc.with_ymd_and_hms(2024, 3, 10, 12, 34, 56).unwrap());

        assert_eq!(
            super::today(),
            NaiveDate::from_ymd_opt(2024, 3, 10).unwrap()
        );

        mock_datetime::clear_mock_time();
    }

    /// モック時間をクリアすると実時間に戻ることを確認する。
    ///
    /// 実時間との比較になるため、過去のモック時間より後であることだけを見る。
    #[test]
    fn test_clear_restores_real_time() {
        let mocked = Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 0).unwrap();
        mock_datetime::set_mock_time(mocked);
        mock_datetime::clear_mock_time();

        assert!(mock_datetime::now() > mocked);
    }
}
