use std::any::Any;

use postline::{
    Client, DecodeError, Result,
    types::{PgComposite, PgEnum, Record},
};

#[derive(Debug, PartialEq)]
enum Mood {
    Sad,
    Happy,
}

impl PgEnum for Mood {
    fn label(&self) -> &str {
        match self {
            Mood::Sad => "sad",
            Mood::Happy => "happy",
        }
    }

    fn from_label(label: &str) -> Option<Self> {
        match label {
            "sad" => Some(Mood::Sad),
            "happy" => Some(Mood::Happy),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq)]
struct Point {
    x: i32,
    y: i32,
}

impl PgComposite for Point {
    fn fields(&self) -> Vec<Option<&(dyn Any + Send + Sync)>> {
        let x: &(dyn Any + Send + Sync) = &self.x;
        let y: &(dyn Any + Send + Sync) = &self.y;
        vec![Some(x), Some(y)]
    }

    fn from_record(mut record: Record) -> std::result::Result<Self, DecodeError> {
        Ok(Self { x: record.take(0)?, y: record.take(1)? })
    }
}

pub async fn main() -> Result<()> {
    let client = Client::connect_env().await?;
    client
        .simple_query("DROP TYPE IF EXISTS mood; CREATE TYPE mood AS ENUM ('sad', 'happy');")
        .await?;
    client
        .simple_query("DROP TYPE IF EXISTS point2; CREATE TYPE point2 AS (x int4, y int4);")
        .await?;

    client.register_enum::<Mood>("mood").await?;
    client.register_composite::<Point>("point2").await?;

    let rows = client
        .execute("SELECT $1::mood, ARRAY['sad', 'happy']::mood[], $2::point2", &[&Mood::Happy, &Point { x: 1, y: 2 }])
        .await?;
    let (mood, moods, point) = rows.into_rows().remove(0).decode::<(Mood, Vec<Mood>, Point)>()?;

    assert_eq!(mood, Mood::Happy);
    assert_eq!(moods, [Mood::Sad, Mood::Happy]);
    assert_eq!(point, Point { x: 1, y: 2 });

    let json = client
        .execute("SELECT $1::jsonb", &[&serde_json::json!({ "a": [1, 2] })])
        .await?
        .into_rows()
        .remove(0)
        .try_get::<_, serde_json::Value>(0usize)?;
    assert_eq!(json["a"][1], 2);

    let now = client
        .execute("SELECT now()", &[])
        .await?
        .into_rows()
        .remove(0)
        .try_get::<_, time::OffsetDateTime>(0usize)?;
    tracing::info!("server time {now}");

    Ok(())
}
